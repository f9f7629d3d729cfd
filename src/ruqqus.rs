//! Ruqqus archive dumps (`submissions*.7z`, `comments*.7z`).
//!
//! Ruqqus calls communities "guilds" and permalinks use `/+guild/...`; both are
//! mapped onto the Reddit-shaped canonical record. Ids are platform-prefixed so
//! they cannot collide with Reddit ids in a shared store.

use crate::importer::{bool_field, int_field, obj, required_str, required_time, str_field, text_or_empty, Platform};
use crate::records::{CanonicalComment, CanonicalPost, Normalized, SkipReason};
use serde_json::{Map, Value};

const PLATFORM: Platform = Platform::Ruqqus;

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

/// `/+Guild/post/1` -> `/g/Guild/post/1`
fn guild_permalink(p: &str) -> String {
    match p.strip_prefix("/+") {
        Some(rest) => format!("/g/{rest}"),
        None => p.to_string(),
    }
}

/// Comments carry the guild as an object; anything else yields an empty name.
fn guild_name(o: &Map<String, Value>) -> String {
    match o.get("guild") {
        Some(Value::Object(g)) => str_field(g, "name").unwrap_or_default(),
        _ => str_field(o, "guild_name").unwrap_or_default(),
    }
}

fn post(raw: &Value) -> Result<CanonicalPost, SkipReason> {
    let o = obj(raw)?;
    let raw_id = required_str(o, "id")?;
    let subreddit = required_str(o, "guild_name")?;
    let author = required_str(o, "author_name")?;
    let title = required_str(o, "title")?;
    let created_utc = required_time(o)?;

    let selftext = text_or_empty(o, "body");
    let id = PLATFORM.prefix_id(&raw_id);
    let permalink = str_field(o, "permalink")
        .map(|p| guild_permalink(&p))
        .unwrap_or_else(|| format!("/g/{subreddit}/post/{raw_id}"));

    Ok(CanonicalPost {
        platform: PLATFORM.id().to_string(),
        url: text_or_empty(o, "url"),
        score: int_field(o, "score").unwrap_or(0),
        num_comments: int_field(o, "comment_count").unwrap_or(0),
        is_self: !selftext.is_empty(),
        over_18: bool_field(o, "is_nsfw").unwrap_or(false),
        locked: bool_field(o, "is_archived").unwrap_or(false),
        stickied: bool_field(o, "is_pinned").unwrap_or(false),
        ups: int_field(o, "upvotes"),
        downs: int_field(o, "downvotes"),
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
    let raw_id = required_str(o, "id")?;
    let raw_post = required_str(o, "post_id")?;
    let author = required_str(o, "author_name")?;
    let body = required_str(o, "body")?;
    let created_utc = required_time(o)?;
    let subreddit = guild_name(o);

    let post_id = PLATFORM.prefix_id(&raw_post);
    let link_id = format!("t3_{post_id}");
    // ancestor chain; the last element is the direct parent
    let parent_id = match o.get("parent_comment_id") {
        Some(Value::Array(chain)) => chain
            .iter()
            .rev()
            .find_map(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .map(|p| format!("t1_{}", PLATFORM.prefix_id(&p))),
        Some(Value::String(s)) if !s.is_empty() => Some(format!("t1_{}", PLATFORM.prefix_id(s))),
        _ => None,
    }
    .unwrap_or_else(|| link_id.clone());

    let permalink = str_field(o, "permalink")
        .map(|p| guild_permalink(&p))
        .unwrap_or_else(|| format!("/g/{subreddit}/post/{raw_post}/comment/{raw_id}"));

    Ok(CanonicalComment {
        id: PLATFORM.prefix_id(&raw_id),
        platform: PLATFORM.id().to_string(),
        score: int_field(o, "score").unwrap_or(0),
        depth: int_field(o, "level").unwrap_or(0),
        stickied: bool_field(o, "is_pinned").unwrap_or(false),
        ups: int_field(o, "upvotes"),
        downs: int_field(o, "downvotes"),
        json_data: raw.clone(),
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
