//! Canonical record shapes every platform importer normalizes into.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPost {
    pub id: String,
    pub platform: String,
    pub subreddit: String,
    pub author: String,
    pub title: String,
    pub selftext: String,
    pub url: String,
    pub permalink: String,
    pub created_utc: i64,
    pub score: i64,
    pub num_comments: i64,
    pub is_self: bool,
    pub over_18: bool,
    pub locked: bool,
    pub stickied: bool,
    pub ups: Option<i64>,
    pub downs: Option<i64>,
    /// Raw upstream record, preserved verbatim.
    pub json_data: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalComment {
    pub id: String,
    pub platform: String,
    /// Id of the post this comment belongs to (no type prefix).
    pub post_id: String,
    /// `t3_<post>` for top-level comments, `t1_<comment>` for replies.
    pub parent_id: String,
    pub link_id: String,
    pub subreddit: String,
    pub author: String,
    pub body: String,
    pub permalink: String,
    pub created_utc: i64,
    pub score: i64,
    pub depth: i64,
    pub stickied: bool,
    pub ups: Option<i64>,
    pub downs: Option<i64>,
    pub json_data: Value,
}

/// Why a raw line produced no record. Expected and frequent; never an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    EmptyLine,
    BadJson,
    NotAnObject,
    MissingField(&'static str),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::EmptyLine => f.write_str("empty line"),
            SkipReason::BadJson => f.write_str("unparseable JSON"),
            SkipReason::NotAnObject => f.write_str("record is not a JSON object"),
            SkipReason::MissingField(k) => write!(f, "missing required field '{k}'"),
        }
    }
}

/// Outcome of normalizing one raw line.
#[derive(Clone, Debug, PartialEq)]
pub enum Normalized<T> {
    Record(T),
    Skip(SkipReason),
}

impl<T> Normalized<T> {
    pub fn record(self) -> Option<T> {
        match self {
            Normalized::Record(r) => Some(r),
            Normalized::Skip(_) => None,
        }
    }

    /// Malformed input as opposed to an incomplete-but-valid record.
    pub fn is_bad_line(&self) -> bool {
        matches!(self, Normalized::Skip(SkipReason::BadJson | SkipReason::NotAnObject))
    }
}

/// Anything that carries a community name and an author; used for filtering and
/// user-activity tracking without caring whether it is a post or a comment.
pub trait Authored {
    fn id(&self) -> &str;
    fn subreddit(&self) -> &str;
    fn author(&self) -> &str;
}

impl Authored for CanonicalPost {
    fn id(&self) -> &str {
        &self.id
    }
    fn subreddit(&self) -> &str {
        &self.subreddit
    }
    fn author(&self) -> &str {
        &self.author
    }
}

impl Authored for CanonicalComment {
    fn id(&self) -> &str {
        &self.id
    }
    fn subreddit(&self) -> &str {
        &self.subreddit
    }
    fn author(&self) -> &str {
        &self.author
    }
}
