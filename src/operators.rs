//! Google-style inline search operators (`sub:`, `author:`, `score:`, `type:`, `sort:`).
//!
//! Only the operator grammar is recognized. Everything else, including quoted
//! phrases, `OR` and `-exclude` tokens, is passed through as free text.

use crate::safe_regex::{RegexFlags, SafeRegex};
use std::fmt;

/// Inputs are cut to this many characters before any pattern runs.
pub const MAX_OPERATOR_INPUT: usize = 500;

const SUB_PATTERN: &str = r"^(?:sub|subreddit):(?:/?r/)?([A-Za-z0-9_]+)$";
const AUTHOR_PATTERN: &str = r"^(?:author|user):(?:/?u/)?([A-Za-z0-9_-]+)$";
const SCORE_PATTERN: &str = r"^score:>?=?(-?\d{1,9})\+?$";
const TYPE_PATTERN: &str = r"^type:(posts?|comments?)$";
const SORT_PATTERN: &str = r"^sort:(rank|relevance|score|top|date|new|newest|old|oldest)$";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedSearchQuery {
    pub query_text: String,
    pub subreddit: Option<String>,
    pub author: Option<String>,
    pub min_score: i64,
    pub result_type: Option<String>,
    /// One of `rank`, `score`, `created_utc`, `created_utc_asc`.
    pub sort_by: Option<String>,
}

impl ParsedSearchQuery {
    pub fn new(query_text: impl Into<String>) -> Self {
        Self { query_text: query_text.into(), ..Self::default() }
    }
}

impl fmt::Display for ParsedSearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.query_text.is_empty() {
            parts.push(format!("query=\"{}\"", self.query_text));
        }
        if let Some(s) = &self.subreddit {
            parts.push(format!("sub:{s}"));
        }
        if let Some(a) = &self.author {
            parts.push(format!("author:{a}"));
        }
        if self.min_score > 0 {
            parts.push(format!("score:{}+", self.min_score));
        }
        if let Some(t) = &self.result_type {
            parts.push(format!("type:{t}"));
        }
        if let Some(s) = &self.sort_by {
            parts.push(format!("sort:{s}"));
        }
        f.write_str(&parts.join(" "))
    }
}

fn sort_key(raw: &str) -> &'static str {
    match raw.to_ascii_lowercase().as_str() {
        "score" | "top" => "score",
        "date" | "new" | "newest" => "created_utc",
        "old" | "oldest" => "created_utc_asc",
        _ => "rank",
    }
}

/// Split on whitespace, keeping `"quoted phrases"` as single tokens.
fn tokenize(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        if bytes[i] == b'"' {
            i += 1;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            i = (i + 1).min(bytes.len());
        }
        while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        out.push(&s[start..i]);
    }
    out
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Extract operators from `raw`. The first occurrence of each operator wins;
/// later repeats are dropped from the free text as well.
pub fn parse_search_operators(raw: &str, regex: &SafeRegex) -> ParsedSearchQuery {
    let input = truncate_chars(raw.trim(), MAX_OPERATOR_INPUT);
    let mut parsed = ParsedSearchQuery::default();
    let mut free: Vec<&str> = Vec::new();
    let mut score_seen = false;
    let flags = RegexFlags::IGNORE_CASE;

    let group = |pattern: &str, tok: &str| -> Option<String> {
        regex
            .match_start(pattern, tok, flags)
            .and_then(|c| c.get(1).map(|m| m.as_str().to_string()))
    };

    for tok in tokenize(input) {
        if tok.starts_with('"') || !tok.contains(':') {
            free.push(tok);
            continue;
        }
        if let Some(v) = group(SUB_PATTERN, tok) {
            parsed.subreddit.get_or_insert(v);
        } else if let Some(v) = group(AUTHOR_PATTERN, tok) {
            parsed.author.get_or_insert(v);
        } else if let Some(v) = group(SCORE_PATTERN, tok) {
            match v.parse::<i64>() {
                Ok(n) if !score_seen => {
                    parsed.min_score = n;
                    score_seen = true;
                }
                Ok(_) => {}
                Err(_) => free.push(tok),
            }
        } else if let Some(v) = group(TYPE_PATTERN, tok) {
            let kind = if v.to_ascii_lowercase().starts_with("post") { "post" } else { "comment" };
            parsed.result_type.get_or_insert_with(|| kind.to_string());
        } else if let Some(v) = group(SORT_PATTERN, tok) {
            parsed.sort_by.get_or_insert_with(|| sort_key(&v).to_string());
        } else {
            free.push(tok);
        }
    }

    parsed.query_text = free.join(" ");
    parsed
}

/// HTML-escape user-provided text before it is embedded in markup.
pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

/// Human-readable summary of what is being searched, safe to embed in HTML.
pub fn format_search_breadcrumb(q: &ParsedSearchQuery) -> String {
    let mut s = if q.query_text.is_empty() {
        "Searching all content".to_string()
    } else {
        format!("Searching for {}", escape_html(&q.query_text))
    };
    match &q.subreddit {
        Some(sub) => s.push_str(&format!(" in {}", escape_html(sub))),
        None => s.push_str(" in all communities"),
    }
    if let Some(author) = &q.author {
        s.push_str(&format!(" by u/{}", escape_html(author)));
    }
    match q.result_type.as_deref() {
        Some("post") => s.push_str(" (posts only)"),
        Some("comment") => s.push_str(" (comments only)"),
        _ => {}
    }
    if q.min_score > 0 {
        s.push_str(&format!(" (score {}+)", q.min_score));
    }
    match q.sort_by.as_deref() {
        Some("score") => s.push_str(" sorted by score"),
        Some("created_utc") => s.push_str(" sorted by newest"),
        Some("created_utc_asc") => s.push_str(" sorted by oldest"),
        _ => {}
    }
    s
}

/// Operator cheat-sheet for search pages.
pub fn search_tips_html() -> &'static str {
    r#"<div class="search-tips">
  <h4>Search tips</h4>
  <ul>
    <li><code>sub:name</code> limit to one community</li>
    <li><code>author:name</code> only posts and comments by a user</li>
    <li><code>score:10+</code> minimum score</li>
    <li><code>type:post</code> or <code>type:comment</code></li>
    <li><code>sort:score</code>, <code>sort:new</code>, <code>sort:old</code></li>
    <li><code>"exact phrase"</code> for quoted phrases, <code>word1 OR word2</code>, <code>-exclude</code></li>
  </ul>
</div>"#
}
