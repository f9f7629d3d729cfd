//! Platform dispatch: file detection, id prefixing and record streaming for every
//! supported source. Per-platform field mapping lives in `reddit` and `ruqqus`.

use crate::decoder::{DecodeCfg, StreamDecoder};
use crate::error::ArchiveError;
use crate::records::{Authored, CanonicalComment, CanonicalPost, Normalized, SkipReason};
use crate::{reddit, ruqqus};
use ahash::AHashSet;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Platform {
    Reddit,
    Ruqqus,
}

/// Archive files found in one input directory, grouped by record family.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DetectedFiles {
    pub posts: Vec<PathBuf>,
    pub comments: Vec<PathBuf>,
}

impl DetectedFiles {
    pub fn all(&self) -> impl Iterator<Item = &PathBuf> {
        self.posts.iter().chain(self.comments.iter())
    }
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Reddit, Platform::Ruqqus];

    pub fn id(self) -> &'static str {
        match self {
            Platform::Reddit => "reddit",
            Platform::Ruqqus => "ruqqus",
        }
    }

    pub fn parse(s: &str) -> Result<Platform> {
        let s = s.trim();
        Platform::ALL
            .into_iter()
            .find(|p| p.id().eq_ignore_ascii_case(s))
            .ok_or_else(|| ArchiveError::UnknownPlatform(s.to_string()).into())
    }

    /// Disambiguate raw ids across platforms. Reddit ids stay as-is so existing
    /// `t3_`/`t1_` references keep resolving.
    pub fn prefix_id(self, id: &str) -> String {
        match self {
            Platform::Reddit => id.to_string(),
            other => format!("{}_{}", other.id(), id),
        }
    }

    fn extensions(self) -> &'static [&'static str] {
        match self {
            Platform::Reddit => &["zst", "zstd", "ndjson", "jsonl", "json"],
            Platform::Ruqqus => &["7z"],
        }
    }

    /// Find post and comment archives directly inside `dir` by filename heuristics
    /// ("submission" / "comment" tokens plus a known extension).
    pub fn detect_files(self, dir: &Path) -> Result<DetectedFiles> {
        if !dir.is_dir() {
            return Err(ArchiveError::not_found(dir, "input directory").into());
        }
        let exts = self.extensions();
        let mut found = DetectedFiles::default();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.with_context(|| format!("scan {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_lowercase();
            let ext_ok = Path::new(&name)
                .extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| exts.contains(&e));
            if !ext_ok {
                continue;
            }
            if name.contains("submission") {
                found.posts.push(entry.into_path());
            } else if name.contains("comment") {
                found.comments.push(entry.into_path());
            }
        }
        if found.posts.is_empty() && found.comments.is_empty() {
            return Err(ArchiveError::not_found(
                dir,
                format!("{} submission/comment archives", self.id()),
            )
            .into());
        }
        tracing::info!(
            "{}: detected {} post file(s), {} comment file(s) in {}",
            self.id(),
            found.posts.len(),
            found.comments.len(),
            dir.display()
        );
        Ok(found)
    }

    pub fn normalize_post(self, raw: &Value) -> Normalized<CanonicalPost> {
        match self {
            Platform::Reddit => reddit::normalize_post(raw),
            Platform::Ruqqus => ruqqus::normalize_post(raw),
        }
    }

    pub fn normalize_comment(self, raw: &Value) -> Normalized<CanonicalComment> {
        match self {
            Platform::Reddit => reddit::normalize_comment(raw),
            Platform::Ruqqus => ruqqus::normalize_comment(raw),
        }
    }

    pub fn normalize_post_line(self, line: &str) -> Normalized<CanonicalPost> {
        match parse_line(line) {
            Ok(v) => self.normalize_post(&v),
            Err(reason) => Normalized::Skip(reason),
        }
    }

    pub fn normalize_comment_line(self, line: &str) -> Normalized<CanonicalComment> {
        match parse_line(line) {
            Ok(v) => self.normalize_comment(&v),
            Err(reason) => Normalized::Skip(reason),
        }
    }

    pub fn stream_posts(
        self,
        path: &Path,
        filter: Option<&CommunityFilter>,
        cfg: &DecodeCfg,
    ) -> Result<RecordStream<CanonicalPost>> {
        RecordStream::open(path, filter.cloned(), cfg, move |l| self.normalize_post_line(l))
    }

    pub fn stream_comments(
        self,
        path: &Path,
        filter: Option<&CommunityFilter>,
        cfg: &DecodeCfg,
    ) -> Result<RecordStream<CanonicalComment>> {
        RecordStream::open(path, filter.cloned(), cfg, move |l| self.normalize_comment_line(l))
    }
}

fn parse_line(line: &str) -> std::result::Result<Value, SkipReason> {
    let line = line.trim();
    if line.is_empty() {
        return Err(SkipReason::EmptyLine);
    }
    match serde_json::from_str::<Value>(line) {
        Ok(v) if v.is_object() => Ok(v),
        Ok(_) => Err(SkipReason::NotAnObject),
        Err(_) => Err(SkipReason::BadJson),
    }
}

// ----------------------------- Community filter ------------------------------------

/// Case-insensitive set of community names.
#[derive(Clone, Debug, Default)]
pub struct CommunityFilter {
    names: AHashSet<String>,
}

impl CommunityFilter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names
            .into_iter()
            .map(|s| crate::util::normalize_community(s.as_ref()))
            .filter(|s| !s.is_empty())
            .collect();
        Self { names }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn matches(&self, community: &str) -> bool {
        self.names.is_empty() || self.names.contains(&community.to_lowercase())
    }
}

// ----------------------------- Record stream ------------------------------------

/// Counters kept while streaming one file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamCounts {
    pub total_lines: u64,
    pub records: u64,
    pub filtered: u64,
    pub bad_lines: u64,
    pub incomplete: u64,
}

/// Lazy sequence of canonical records decoded from one archive file.
pub struct RecordStream<T> {
    decoder: StreamDecoder,
    filter: Option<CommunityFilter>,
    normalize: Box<dyn Fn(&str) -> Normalized<T> + Send>,
    counts: StreamCounts,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Authored> RecordStream<T> {
    fn open(
        path: &Path,
        filter: Option<CommunityFilter>,
        cfg: &DecodeCfg,
        normalize: impl Fn(&str) -> Normalized<T> + Send + 'static,
    ) -> Result<Self> {
        let decoder = StreamDecoder::open(path, cfg)?;
        Ok(Self {
            decoder,
            filter: filter.filter(|f| !f.is_empty()),
            normalize: Box::new(normalize),
            counts: StreamCounts::default(),
            _marker: PhantomData,
        })
    }

    pub fn counts(&self) -> StreamCounts {
        self.counts
    }

    pub fn position(&self) -> u64 {
        self.decoder.position()
    }
}

impl StreamCounts {
    /// Tally one decoded line and pass the record through when it survives `filter`.
    pub fn observe<T: Authored>(&mut self, line: Normalized<T>, filter: Option<&CommunityFilter>) -> Option<T> {
        self.total_lines += 1;
        match line {
            Normalized::Record(rec) => {
                if filter.is_some_and(|f| !f.matches(rec.subreddit())) {
                    self.filtered += 1;
                    return None;
                }
                self.records += 1;
                Some(rec)
            }
            Normalized::Skip(SkipReason::EmptyLine) => None,
            Normalized::Skip(SkipReason::BadJson | SkipReason::NotAnObject) => {
                self.bad_lines += 1;
                None
            }
            Normalized::Skip(_) => {
                self.incomplete += 1;
                None
            }
        }
    }
}

impl<T: Authored> Iterator for RecordStream<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        while let Some(line) = self.decoder.next() {
            let normalized = (self.normalize)(&line.text);
            if let Some(rec) = self.counts.observe(normalized, self.filter.as_ref()) {
                return Some(rec);
            }
        }
        None
    }
}

// ----------------------------- Field helpers ------------------------------------

pub(crate) fn obj(raw: &Value) -> std::result::Result<&Map<String, Value>, SkipReason> {
    raw.as_object().ok_or(SkipReason::NotAnObject)
}

/// Non-empty string field; numeric ids are stringified.
pub(crate) fn str_field(o: &Map<String, Value>, key: &str) -> Option<String> {
    match o.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn required_str(o: &Map<String, Value>, key: &'static str) -> std::result::Result<String, SkipReason> {
    str_field(o, key).ok_or(SkipReason::MissingField(key))
}

pub(crate) fn text_or_empty(o: &Map<String, Value>, key: &str) -> String {
    match o.get(key) {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

/// Integer field tolerant of floats and numeric strings.
pub(crate) fn int_field(o: &Map<String, Value>, key: &str) -> Option<i64> {
    match o.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

pub(crate) fn bool_field(o: &Map<String, Value>, key: &str) -> Option<bool> {
    match o.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

pub(crate) fn required_time(o: &Map<String, Value>) -> std::result::Result<i64, SkipReason> {
    int_field(o, "created_utc").ok_or(SkipReason::MissingField("created_utc"))
}
