#![allow(dead_code)]

use anyhow::Result;
use redarc::{CanonicalComment, CanonicalPost, MemorySampler, Platform, Store};
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Write a compressed `.zst` file containing the provided JSONL lines.
pub fn write_zst_lines(path: &Path, lines: &[String]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let f = File::create(path).unwrap();
    let mut enc = zstd::stream::write::Encoder::new(f, 3).unwrap();
    for l in lines {
        writeln!(&mut enc, "{}", l).unwrap();
    }
    enc.finish().unwrap();
}

/// Same as `write_zst_lines` for `json!` values.
pub fn write_zst_values(path: &Path, values: &[Value]) {
    let lines: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    write_zst_lines(path, &lines);
}

/// Decompress a `.zst` file and collect its non-empty lines.
pub fn decompress_zst_lines(path: &Path) -> Vec<String> {
    let f = File::open(path).unwrap();
    let dec = zstd::stream::read::Decoder::new(f).unwrap();
    let r = BufReader::new(dec);
    r.lines().map(|l| l.unwrap()).filter(|s| !s.is_empty()).collect()
}

/// A fresh on-disk store with the schema applied. Keep the `TempDir` alive.
pub fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("archive.db"), 2).unwrap();
    store.ensure_schema().unwrap();
    (dir, store)
}

pub fn reddit_post_json(id: &str, subreddit: &str, author: &str, title: &str, selftext: &str, score: i64) -> Value {
    json!({
        "id": id, "subreddit": subreddit, "author": author, "title": title,
        "selftext": selftext, "created_utc": 1_136_073_600, "score": score,
        "num_comments": 0, "url": format!("https://example.com/{id}"), "over_18": false
    })
}

pub fn reddit_comment_json(id: &str, post_id: &str, subreddit: &str, author: &str, body: &str, score: i64) -> Value {
    json!({
        "id": id, "link_id": format!("t3_{post_id}"), "parent_id": format!("t3_{post_id}"),
        "subreddit": subreddit, "author": author, "body": body,
        "created_utc": 1_136_074_600, "score": score
    })
}

pub fn post(id: &str, subreddit: &str, author: &str, title: &str, selftext: &str, score: i64) -> CanonicalPost {
    Platform::Reddit
        .normalize_post(&reddit_post_json(id, subreddit, author, title, selftext, score))
        .record()
        .unwrap()
}

pub fn comment(id: &str, post_id: &str, subreddit: &str, author: &str, body: &str, score: i64) -> CanonicalComment {
    Platform::Reddit
        .normalize_comment(&reddit_comment_json(id, post_id, subreddit, author, body, score))
        .record()
        .unwrap()
}

/// Reddit dump directory: two subreddits, posts and comments, one bad line each.
///
/// - r/rust: p1 (alice), p2 (bob); comments c1 (carol -> p1), c2 (alice -> p2)
/// - r/golang: p3 (dave); comment c3 (erin -> p3)
pub fn make_reddit_dump() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let mut posts: Vec<String> = vec![
        reddit_post_json("p1", "rust", "alice", "Borrow checker tips", "lifetimes explained", 10),
        reddit_post_json("p2", "Rust", "bob", "Async runtimes", "tokio versus smol", 3),
        reddit_post_json("p3", "golang", "dave", "Goroutines", "channels everywhere", 7),
    ]
    .iter()
    .map(Value::to_string)
    .collect();
    posts.push("{not json".to_string());
    write_zst_lines(&dir.path().join("RS_2006-01_submissions.zst"), &posts);

    let mut comments: Vec<String> = vec![
        reddit_comment_json("c1", "p1", "rust", "carol", "great lifetimes writeup", 4),
        reddit_comment_json("c2", "p2", "rust", "alice", "smol is small", 1),
        reddit_comment_json("c3", "p3", "golang", "erin", "select statements", 2),
    ]
    .iter()
    .map(Value::to_string)
    .collect();
    comments.push("[1, 2, 3]".to_string());
    write_zst_lines(&dir.path().join("RC_2006-01_comments.zst"), &comments);
    dir
}

/// Memory sampler returning whatever the test last stored.
#[derive(Clone, Default)]
pub struct FakeSampler {
    pub bytes: Arc<AtomicU64>,
}

impl FakeSampler {
    pub fn new(bytes: u64) -> Self {
        Self { bytes: Arc::new(AtomicU64::new(bytes)) }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }
}

impl MemorySampler for FakeSampler {
    fn resident_bytes(&mut self) -> Result<u64> {
        Ok(self.bytes.load(Ordering::SeqCst))
    }
}

pub const GB: u64 = 1024 * 1024 * 1024;

pub fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

pub fn output_dir(tmp: &tempfile::TempDir) -> PathBuf {
    tmp.path().join("out")
}
