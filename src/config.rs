use crate::importer::Platform;
use crate::util::{normalize_community, split_list};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// User-facing ingestion options with sensible defaults and builder chaining.
#[derive(Clone, Debug)]
pub struct IngestOptions {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub db_path: PathBuf,
    pub platform: Platform,
    pub subreddits: Option<Vec<String>>, // normalized lowercase, no "r/"
    pub subreddits_file: Option<PathBuf>,
    pub batch_size: usize,
    pub max_memory_gb: f64,              // 0 = unbounded
    pub high_activity_threshold: u64,    // records per user to count as high-activity
    pub pool_size: usize,
    pub progress: bool,
    pub resume_mode: bool,
    pub sevenzip_bin: String,
    pub verify_archives: bool,

    // IO tuning
    pub chunk_bytes: usize,       // decompressed bytes per decode step
    pub read_buffer_bytes: usize, // BufReader capacity over the compressed file
}

impl Default for IngestOptions {
    fn default() -> Self {
        let out = PathBuf::from("output");
        Self {
            input_dir: PathBuf::from("data"),
            db_path: out.join("archive.db"),
            output_dir: out,
            platform: Platform::Reddit,
            subreddits: None,
            subreddits_file: None,
            batch_size: 5_000,
            max_memory_gb: 0.0,
            high_activity_threshold: 100,
            pool_size: 4,
            progress: true,
            resume_mode: false,
            sevenzip_bin: "7z".to_string(),
            verify_archives: false,

            chunk_bytes: 1 << 20,
            read_buffer_bytes: 256 * 1024,
        }
    }
}

impl IngestOptions {
    pub fn with_input_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.input_dir = dir.as_ref().to_path_buf();
        self
    }
    pub fn with_output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = dir.as_ref().to_path_buf();
        self
    }
    pub fn with_db_path(mut self, path: impl AsRef<Path>) -> Self {
        self.db_path = path.as_ref().to_path_buf();
        self
    }
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }
    pub fn with_subreddits<I, S>(mut self, subs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let v: Vec<String> = subs
            .into_iter()
            .map(|s| normalize_community(s.as_ref()))
            .filter(|s| !s.is_empty())
            .collect();
        self.subreddits = if v.is_empty() { None } else { Some(v) };
        self
    }
    pub fn with_subreddits_file(mut self, path: impl AsRef<Path>) -> Self {
        self.subreddits_file = Some(path.as_ref().to_path_buf());
        self
    }
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }
    pub fn with_max_memory_gb(mut self, gb: f64) -> Self {
        self.max_memory_gb = gb.max(0.0);
        self
    }
    pub fn with_high_activity_threshold(mut self, n: u64) -> Self {
        self.high_activity_threshold = n.max(1);
        self
    }
    pub fn with_pool_size(mut self, n: usize) -> Self {
        self.pool_size = n.max(1);
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }
    pub fn with_resume_mode(mut self, yes: bool) -> Self {
        self.resume_mode = yes;
        self
    }
    pub fn with_verify_archives(mut self, yes: bool) -> Self {
        self.verify_archives = yes;
        self
    }
    pub fn with_sevenzip_bin(mut self, bin: impl Into<String>) -> Self {
        self.sevenzip_bin = bin.into();
        self
    }

    // IO tuning
    pub fn with_chunk_bytes(mut self, bytes: usize) -> Self {
        self.chunk_bytes = bytes.max(4 * 1024);
        self
    }
    pub fn with_io_read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer_bytes = bytes.max(8 * 1024);
        self
    }

    pub fn artifact_policy(&self) -> ArtifactPolicy {
        ArtifactPolicy { resume_mode: self.resume_mode }
    }

    /// Overlay `ARCHIVE_*` environment variables on top of `self`.
    pub fn from_env(self) -> Result<Self> {
        self.overlay(|k| std::env::var(k).ok())
    }

    /// Same as `from_env` with an injectable lookup.
    pub fn overlay(mut self, get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("ARCHIVE_INPUT_DIR") {
            self = self.with_input_dir(v);
        }
        if let Some(v) = get("ARCHIVE_OUTPUT_DIR") {
            let out = PathBuf::from(v);
            // keep the database next to the output unless placed explicitly
            if self.db_path == self.output_dir.join("archive.db") {
                self.db_path = out.join("archive.db");
            }
            self.output_dir = out;
        }
        if let Some(v) = get("ARCHIVE_DB_PATH") {
            self = self.with_db_path(v);
        }
        if let Some(v) = get("ARCHIVE_PLATFORM") {
            self.platform = Platform::parse(&v)?;
        }
        if let Some(v) = get("ARCHIVE_SUBREDDITS") {
            self = self.with_subreddits(split_list(&v));
        }
        if let Some(v) = get("ARCHIVE_SUBREDDITS_FILE") {
            self = self.with_subreddits_file(v);
        }
        if let Some(v) = get("ARCHIVE_BATCH_SIZE") {
            let n: usize = v.parse().with_context(|| format!("ARCHIVE_BATCH_SIZE={v}"))?;
            self = self.with_batch_size(n);
        }
        if let Some(v) = get("ARCHIVE_MAX_MEMORY_GB") {
            let gb: f64 = v.parse().with_context(|| format!("ARCHIVE_MAX_MEMORY_GB={v}"))?;
            self = self.with_max_memory_gb(gb);
        }
        if let Some(v) = get("ARCHIVE_RESUME_MODE") {
            self.resume_mode = parse_flag(&v);
        }
        if let Some(v) = get("ARCHIVE_PROGRESS") {
            self.progress = parse_flag(&v);
        }
        if let Some(v) = get("ARCHIVE_VERIFY") {
            self.verify_archives = parse_flag(&v);
        }
        if let Some(v) = get("SEVENZIP_BIN") {
            self.sevenzip_bin = v;
        }
        Ok(self)
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Whether idempotent derived artifacts (sitemaps, robots.txt, user pages)
/// should be written again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArtifactPolicy {
    pub resume_mode: bool,
}

impl ArtifactPolicy {
    pub fn should_regenerate(&self, artifact: &Path) -> bool {
        !(self.resume_mode && artifact.exists())
    }
}
