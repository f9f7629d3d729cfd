//! Pushshift-style Reddit dumps (`*_submissions.zst`, `*_comments.zst`).

use crate::importer::{bool_field, int_field, obj, required_str, required_time, str_field, text_or_empty};
use crate::records::{CanonicalComment, CanonicalPost, Normalized, SkipReason};
use serde_json::Value;

const PLATFORM: &str = "reddit";

pub fn normalize_post(raw: &Value) -> Normalized<CanonicalPost> {
    match post(raw) {
        Ok(p) => Normalized::Record(p),
        Err(reason) => Normalized::Skip(reason),
    }
}

pub fn normalize_comment(raw: &Value) -> Normalized<CanonicalComment> {
    match comment(raw) {
        Ok(c) => Normalized::Record(c),
        Err(reason) => Normalized::Skip(reason),
    }
}

fn post(raw: &Value) -> Result<CanonicalPost, SkipReason> {
    let o = obj(raw)?;
    let id = required_str(o, "id")?;
    let subreddit = required_str(o, "subreddit")?;
    let author = required_str(o, "author")?;
    let title = required_str(o, "title")?;
    let created_utc = required_time(o)?;

    let selftext = text_or_empty(o, "selftext");
    let permalink = str_field(o, "permalink").unwrap_or_else(|| format!("/r/{subreddit}/comments/{id}/"));
    let is_self = bool_field(o, "is_self").unwrap_or(!selftext.is_empty());

    Ok(CanonicalPost {
        platform: PLATFORM.to_string(),
        url: text_or_empty(o, "url"),
        score: int_field(o, "score").unwrap_or(0),
        num_comments: int_field(o, "num_comments").unwrap_or(0),
        is_self,
        over_18: bool_field(o, "over_18").unwrap_or(false),
        locked: bool_field(o, "locked").unwrap_or(false),
        stickied: bool_field(o, "stickied").unwrap_or(false),
        ups: int_field(o, "ups"),
        downs: int_field(o, "downs"),
        json_data: raw.clone(),
        id,
        subreddit,
        author,
        title,
        selftext,
        permalink,
        created_utc,
    })
}

fn comment(raw: &Value) -> Result<CanonicalComment, SkipReason> {
    let o = obj(raw)?;
    let id = required_str(o, "id")?;
    let subreddit = required_str(o, "subreddit")?;
    let author = required_str(o, "author")?;
    let body = required_str(o, "body")?;
    let created_utc = required_time(o)?;
    let link_id = required_str(o, "link_id")?;

    let post_id = link_id.strip_prefix("t3_").unwrap_or(&link_id).to_string();
    if post_id.is_empty() {
        return Err(SkipReason::MissingField("link_id"));
    }
    // parent_id keeps its type prefix: t3_ = top level, t1_ = reply
    let parent_id = str_field(o, "parent_id").unwrap_or_else(|| link_id.clone());
    let permalink =
        str_field(o, "permalink").unwrap_or_else(|| format!("/r/{subreddit}/comments/{post_id}/_/{id}/"));

    Ok(CanonicalComment {
        platform: PLATFORM.to_string(),
        score: int_field(o, "score").unwrap_or(0),
        depth: int_field(o, "depth").unwrap_or(0),
        stickied: bool_field(o, "stickied").unwrap_or(false),
        ups: int_field(o, "ups"),
        downs: int_field(o, "downs"),
        json_data: raw.clone(),
        id,
        post_id,
        parent_id,
        link_id,
        subreddit,
        author,
        body,
        permalink,
        created_utc,
    })
}
