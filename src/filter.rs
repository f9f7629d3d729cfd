//! Cut a smaller dump out of a large one: keep records from chosen subreddits
//! within a date window, up to an optional record limit.

use crate::decoder::{DecodeCfg, StreamDecoder};
use crate::error::ArchiveError;
use crate::progress::ProgressScope;
use crate::util::{create_with_backoff, normalize_community};
use crate::validation::InputValidator;
use ahash::AHashSet;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use zstd::stream::write::Encoder as ZstdEncoder;

/// Only the fields the filter looks at; serde skips the rest of the record.
#[derive(Debug, Deserialize)]
struct FilterFields {
    #[serde(default)]
    subreddit: Option<String>,
    #[serde(default)]
    created_utc: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct ArchiveFilter {
    subreddits: Option<AHashSet<String>>,
    start: Option<i64>,
    end: Option<i64>,
    limit: Option<u64>,
    level: i32,
    progress: bool,
}

impl Default for ArchiveFilter {
    fn default() -> Self {
        Self { subreddits: None, start: None, end: None, limit: None, level: 3, progress: false }
    }
}

impl ArchiveFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subreddits<I, S>(mut self, subs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: AHashSet<String> = subs
            .into_iter()
            .map(|s| normalize_community(s.as_ref()))
            .filter(|s| !s.is_empty())
            .collect();
        self.subreddits = if set.is_empty() { None } else { Some(set) };
        self
    }

    /// Inclusive bounds in unix seconds.
    pub fn date_range(mut self, start: Option<i64>, end: Option<i64>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Bounds given as `YYYY-MM-DD` (UTC midnight) or unix seconds.
    pub fn date_range_str(self, start: Option<&str>, end: Option<&str>) -> Result<Self> {
        let v = InputValidator::new();
        let s = v.validate_date(start);
        let e = v.validate_date(end);
        if let Some(msg) = s.error.or(e.error) {
            return Err(anyhow!(msg));
        }
        Ok(self.date_range(s.value, e.value))
    }

    pub fn limit(mut self, n: Option<u64>) -> Self {
        self.limit = n.filter(|n| *n > 0);
        self
    }

    pub fn compression_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub total: u64,
    pub matched: u64,
    pub skipped_subreddit: u64,
    pub skipped_date: u64,
    pub errors: u64,
}

fn created_seconds(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0),
        _ => 0,
    }
}

enum Verdict {
    Keep,
    WrongSubreddit,
    OutOfRange,
    Unparseable,
}

impl ArchiveFilter {
    fn judge(&self, line: &str) -> Verdict {
        let rec: FilterFields = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(_) => return Verdict::Unparseable,
        };
        if let Some(subs) = &self.subreddits {
            let sub = rec.subreddit.as_deref().unwrap_or("").to_lowercase();
            if !subs.contains(&sub) {
                return Verdict::WrongSubreddit;
            }
        }
        let created = created_seconds(rec.created_utc.as_ref());
        if self.start.is_some_and(|s| created < s) || self.end.is_some_and(|e| created > e) {
            return Verdict::OutOfRange;
        }
        Verdict::Keep
    }
}

/// Stream `input` (zstd or plain NDJSON) and write matching lines to `output` as zstd.
pub fn filter_archive(input: &Path, output: &Path, filter: &ArchiveFilter) -> Result<FilterStats> {
    if !input.is_file() {
        return Err(ArchiveError::not_found(input, "input archive").into());
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut decoder = StreamDecoder::open(input, &DecodeCfg::default())?;
    let file = create_with_backoff(output, 16, 50).with_context(|| format!("create {}", output.display()))?;
    let mut enc = ZstdEncoder::new(BufWriter::new(file), filter.level)?;

    let total_bytes = fs::metadata(input).map(|m| m.len()).unwrap_or(0);
    let pb = ProgressScope::bytes("Filtering", total_bytes, filter.progress);
    let mut stats = FilterStats::default();

    while let Some(line) = decoder.next() {
        if line.text.trim().is_empty() {
            continue;
        }
        stats.total += 1;
        match filter.judge(&line.text) {
            Verdict::Keep => {
                enc.write_all(line.text.as_bytes())?;
                enc.write_all(b"\n")?;
                stats.matched += 1;
            }
            Verdict::WrongSubreddit => stats.skipped_subreddit += 1,
            Verdict::OutOfRange => stats.skipped_date += 1,
            Verdict::Unparseable => stats.errors += 1,
        }
        if filter.limit.is_some_and(|n| stats.matched >= n) {
            tracing::info!("reached limit of {} records", stats.matched);
            break;
        }
        if stats.total % 100_000 == 0 {
            pb.set_position(decoder.compressed_bytes_read());
        }
    }

    let mut w = enc.finish()?;
    w.flush()?;
    pb.finish("done");
    tracing::info!(
        "filtered {}: {} of {} matched ({} wrong subreddit, {} out of range, {} unparseable)",
        input.display(),
        stats.matched,
        stats.total,
        stats.skipped_subreddit,
        stats.skipped_date,
        stats.errors
    );
    Ok(stats)
}

/// Read a subreddit list: a JSON array of strings, or one name per line
/// (`#` comments, quotes and trailing commas are ignored).
pub fn load_subreddits_from_file(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let content = content.trim();
    let looks_json = content.starts_with('[') || path.extension().is_some_and(|e| e == "json");
    if looks_json {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(content) {
            return Ok(dedup(items.iter().filter_map(Value::as_str).map(normalize_community)));
        }
    }
    Ok(dedup(content.lines().filter_map(|line| {
        let l = line.trim().trim_matches(|c| c == '"' || c == '\'' || c == ',');
        (!l.is_empty() && !l.starts_with('#')).then(|| normalize_community(l))
    })))
}

fn dedup(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = AHashSet::new();
    names.filter(|n| !n.is_empty() && seen.insert(n.clone())).collect()
}
