//! Ranked, paginated full-text search over the posts/comments FTS5 projections.

use crate::error::{FieldError, SearchError};
use crate::operators::{parse_search_operators, ParsedSearchQuery};
use crate::safe_regex::SafeRegex;
use crate::store::Store;
use crate::validation::{InputValidator, IntParam, SearchParams};
use anyhow::Result;
use rusqlite::types::ToSql;
use serde::{Deserialize, Serialize};

/// Query text that matches every row (filter-only browsing).
pub const MATCH_ALL: &str = "*";
const HEADLINE_TOKENS: u32 = 24;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OrderBy {
    #[default]
    Rank,
    Score,
    CreatedDesc,
    CreatedAsc,
}

impl OrderBy {
    /// Unknown keys fall back to `Rank`.
    pub fn parse(s: &str) -> OrderBy {
        match s.trim().to_ascii_lowercase().as_str() {
            "score" | "top" => OrderBy::Score,
            "created_utc" | "date" | "new" | "newest" => OrderBy::CreatedDesc,
            "created_utc_asc" | "old" | "oldest" => OrderBy::CreatedAsc,
            _ => OrderBy::Rank,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderBy::Rank => "rank",
            OrderBy::Score => "score",
            OrderBy::CreatedDesc => "created_utc",
            OrderBy::CreatedAsc => "created_utc_asc",
        }
    }

    fn sql(self) -> &'static str {
        match self {
            OrderBy::Rank => "rank DESC, created_utc DESC, id",
            OrderBy::Score => "score DESC, created_utc DESC, id",
            OrderBy::CreatedDesc => "created_utc DESC, id",
            OrderBy::CreatedAsc => "created_utc ASC, id",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultKind {
    Post,
    Comment,
}

impl ResultKind {
    pub fn parse(s: &str) -> Option<ResultKind> {
        match s.trim().to_ascii_lowercase().as_str() {
            "post" | "posts" => Some(ResultKind::Post),
            "comment" | "comments" => Some(ResultKind::Comment),
            _ => None,
        }
    }
}

/// Validated search request. Build with `SearchQuery::new(text)` and the `with_*` methods.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchQuery {
    pub query_text: String,
    pub subreddit: Option<String>,
    pub author: Option<String>,
    pub result_type: Option<ResultKind>,
    pub min_score: i64,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
    pub limit: u32,
    pub offset: u32,
    pub order_by: OrderBy,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            query_text: String::new(),
            subreddit: None,
            author: None,
            result_type: None,
            min_score: 0,
            start_date: None,
            end_date: None,
            limit: 100,
            offset: 0,
            order_by: OrderBy::Rank,
        }
    }
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self { query_text: text.into(), ..Self::default() }
    }
    pub fn with_subreddit(mut self, s: impl Into<String>) -> Self {
        self.subreddit = Some(s.into());
        self
    }
    pub fn with_author(mut self, a: impl Into<String>) -> Self {
        self.author = Some(a.into());
        self
    }
    pub fn with_result_type(mut self, kind: ResultKind) -> Self {
        self.result_type = Some(kind);
        self
    }
    pub fn with_min_score(mut self, n: i64) -> Self {
        self.min_score = n;
        self
    }
    pub fn with_date_range(mut self, start: Option<i64>, end: Option<i64>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }
    pub fn with_page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
    pub fn with_order_by(mut self, order: OrderBy) -> Self {
        self.order_by = order;
        self
    }
}

/// One matched row. Post-only and comment-only fields are omitted when absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub result_type: String,
    pub id: String,
    pub subreddit: String,
    pub platform: String,
    pub author: String,
    pub created_utc: i64,
    pub score: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selftext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_comments: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_title: Option<String>,
    pub rank: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,
}

// ---- MATCH expression ----

fn quote_atom(raw: &str) -> Option<String> {
    let (body, prefix) = match raw.strip_suffix('*') {
        Some(b) if !raw.starts_with('"') => (b, true),
        _ => (raw, false),
    };
    let body = body.trim_matches('"');
    if !body.chars().any(char::is_alphanumeric) {
        return None;
    }
    let quoted = format!("\"{}\"", body.replace('"', "\"\""));
    Some(if prefix { quoted + "*" } else { quoted })
}

fn split_terms(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        let end = if let Some(after) = rest.strip_prefix('"') {
            after.find('"').map_or(rest.len(), |i| i + 2)
        } else if let Some(after) = rest.strip_prefix("-\"") {
            after.find('"').map_or(rest.len(), |i| i + 3)
        } else {
            rest.find(char::is_whitespace).unwrap_or(rest.len())
        };
        out.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    out
}

/// Compile free text into an FTS5 MATCH expression. Every term is quoted, so user
/// input can never inject FTS syntax. `a OR b` groups, `-term` excludes, `"..."`
/// is a phrase, `term*` a prefix. Returns `None` when nothing searchable remains.
pub fn compile_match(text: &str) -> Option<String> {
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut negatives: Vec<String> = Vec::new();
    let mut join_next = false;

    for tok in split_terms(text) {
        if tok == "OR" {
            join_next = !groups.is_empty();
            continue;
        }
        if let Some(neg) = tok.strip_prefix('-').filter(|t| !t.is_empty()) {
            if let Some(atom) = quote_atom(neg) {
                negatives.push(atom);
            }
            join_next = false;
            continue;
        }
        let Some(atom) = quote_atom(tok) else { continue };
        let joined = std::mem::take(&mut join_next);
        match groups.last_mut() {
            Some(last) if joined => last.push(atom),
            _ => groups.push(vec![atom]),
        }
    }

    if groups.is_empty() {
        return None;
    }
    let positive = groups
        .into_iter()
        .map(|g| if g.len() == 1 { g.concat() } else { format!("({})", g.join(" OR ")) })
        .collect::<Vec<_>>()
        .join(" AND ");
    let mut expr = format!("({positive})");
    for n in negatives {
        expr.push_str(" NOT ");
        expr.push_str(&n);
    }
    Some(expr)
}

// ---- SQL construction ----

struct Compiled {
    select: String,
    count: String,
    binds: Vec<(&'static str, Box<dyn ToSql>)>,
}

fn filters(alias: &str, q: &SearchQuery, binds: &mut Vec<&'static str>) -> String {
    let mut clauses = Vec::new();
    if q.subreddit.is_some() {
        clauses.push(format!("{alias}.subreddit = :subreddit COLLATE NOCASE"));
        binds.push(":subreddit");
    }
    if q.author.is_some() {
        clauses.push(format!("{alias}.author = :author"));
        binds.push(":author");
    }
    if q.min_score != 0 {
        clauses.push(format!("{alias}.score >= :min_score"));
        binds.push(":min_score");
    }
    if q.start_date.is_some() {
        clauses.push(format!("{alias}.created_utc >= :start_date"));
        binds.push(":start_date");
    }
    if q.end_date.is_some() {
        clauses.push(format!("{alias}.created_utc <= :end_date"));
        binds.push(":end_date");
    }
    clauses.into_iter().map(|c| format!(" AND {c}")).collect()
}

fn post_branch(q: &SearchQuery, fts: bool, binds: &mut Vec<&'static str>) -> String {
    let cols = "'post' AS result_type, p.id AS id, p.subreddit AS subreddit, p.platform AS platform, \
                p.author AS author, p.created_utc AS created_utc, p.score AS score, p.title AS title, \
                p.selftext AS selftext, p.num_comments AS num_comments, p.url AS url, p.permalink AS permalink, \
                NULL AS body, NULL AS post_id, NULL AS post_title";
    let f = filters("p", q, binds);
    if fts {
        format!(
            "SELECT {cols}, -bm25(posts_fts) AS rank, \
             snippet(posts_fts, -1, '<mark>', '</mark>', '…', {HEADLINE_TOKENS}) AS headline \
             FROM posts_fts JOIN posts p ON p.seq = posts_fts.rowid \
             WHERE posts_fts MATCH :match{f}"
        )
    } else {
        format!("SELECT {cols}, 0.0 AS rank, substr(p.title, 1, 200) AS headline FROM posts p WHERE 1 = 1{f}")
    }
}

fn comment_branch(q: &SearchQuery, fts: bool, binds: &mut Vec<&'static str>) -> String {
    let cols = "'comment' AS result_type, c.id AS id, c.subreddit AS subreddit, c.platform AS platform, \
                c.author AS author, c.created_utc AS created_utc, c.score AS score, NULL AS title, \
                NULL AS selftext, NULL AS num_comments, NULL AS url, c.permalink AS permalink, \
                c.body AS body, c.post_id AS post_id, pp.title AS post_title";
    let f = filters("c", q, binds);
    if fts {
        format!(
            "SELECT {cols}, -bm25(comments_fts) AS rank, \
             snippet(comments_fts, 0, '<mark>', '</mark>', '…', {HEADLINE_TOKENS}) AS headline \
             FROM comments_fts JOIN comments c ON c.seq = comments_fts.rowid \
             LEFT JOIN posts pp ON pp.id = c.post_id \
             WHERE comments_fts MATCH :match{f}"
        )
    } else {
        format!(
            "SELECT {cols}, 0.0 AS rank, substr(c.body, 1, 200) AS headline \
             FROM comments c LEFT JOIN posts pp ON pp.id = c.post_id WHERE 1 = 1{f}"
        )
    }
}

fn compile(q: &SearchQuery, match_expr: Option<String>) -> Compiled {
    let fts = match_expr.is_some();
    let mut names: Vec<&'static str> = Vec::new();
    let mut branches = Vec::new();
    if q.result_type != Some(ResultKind::Comment) {
        branches.push(post_branch(q, fts, &mut names));
    }
    if q.result_type != Some(ResultKind::Post) {
        branches.push(comment_branch(q, fts, &mut names));
    }
    let union = branches.join(" UNION ALL ");
    let select = format!(
        "SELECT * FROM ({union}) ORDER BY {} LIMIT :limit OFFSET :offset",
        q.order_by.sql()
    );
    let count = format!("SELECT COUNT(*) FROM ({union})");

    names.sort_unstable();
    names.dedup();
    let mut binds: Vec<(&'static str, Box<dyn ToSql>)> = Vec::new();
    if let Some(m) = match_expr {
        binds.push((":match", Box::new(m)));
    }
    for name in names {
        let value: Box<dyn ToSql> = match name {
            ":subreddit" => Box::new(q.subreddit.clone()),
            ":author" => Box::new(q.author.clone()),
            ":min_score" => Box::new(q.min_score),
            ":start_date" => Box::new(q.start_date),
            _ => Box::new(q.end_date),
        };
        binds.push((name, value));
    }
    Compiled { select, count, binds }
}

fn row_to_result(r: &rusqlite::Row<'_>) -> rusqlite::Result<SearchResult> {
    Ok(SearchResult {
        result_type: r.get("result_type")?,
        id: r.get("id")?,
        subreddit: r.get("subreddit")?,
        platform: r.get("platform")?,
        author: r.get("author")?,
        created_utc: r.get("created_utc")?,
        score: r.get("score")?,
        title: r.get("title")?,
        selftext: r.get("selftext")?,
        num_comments: r.get("num_comments")?,
        url: r.get("url")?,
        permalink: r.get("permalink")?,
        body: r.get("body")?,
        post_id: r.get("post_id")?,
        post_title: r.get("post_title")?,
        rank: r.get("rank")?,
        headline: r.get("headline")?,
    })
}

// ---- searcher ----

pub struct Searcher<'a> {
    store: &'a Store,
}

impl<'a> Searcher<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Returns the requested page and the total number of matches.
    pub fn search(&self, q: &SearchQuery) -> Result<(Vec<SearchResult>, u64)> {
        let text = q.query_text.trim();
        if text.is_empty() {
            return Ok((Vec::new(), 0));
        }
        let match_expr = if text == MATCH_ALL {
            None
        } else {
            match compile_match(text) {
                Some(m) => Some(m),
                None => return Ok((Vec::new(), 0)),
            }
        };
        let compiled = compile(q, match_expr);
        tracing::debug!("search sql: {}", compiled.select);

        let conn = self.store.conn();
        let filter_binds: Vec<(&str, &dyn ToSql)> =
            compiled.binds.iter().map(|(n, v)| (*n, &**v)).collect();

        let total: i64 = conn
            .prepare_cached(&compiled.count)?
            .query_row(filter_binds.as_slice(), |r| r.get(0))?;

        let limit = q.limit as i64;
        let offset = q.offset as i64;
        let mut page_binds = filter_binds.clone();
        page_binds.push((":limit", &limit as &dyn ToSql));
        page_binds.push((":offset", &offset as &dyn ToSql));

        let mut stmt = conn.prepare_cached(&compiled.select)?;
        let rows = stmt.query_map(page_binds.as_slice(), row_to_result)?;
        let results = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((results, total.max(0) as u64))
    }

    pub fn search_subreddit(&self, subreddit: &str, text: &str, limit: u32) -> Result<Vec<SearchResult>> {
        let q = SearchQuery::new(text).with_subreddit(subreddit).with_page(limit, 0);
        Ok(self.search(&q)?.0)
    }

    pub fn search_author(&self, author: &str, limit: u32) -> Result<Vec<SearchResult>> {
        let q = SearchQuery::new(MATCH_ALL)
            .with_author(author)
            .with_order_by(OrderBy::CreatedDesc)
            .with_page(limit, 0);
        Ok(self.search(&q)?.0)
    }

    /// Post titles starting with `prefix` (case-insensitive), highest score first.
    pub fn search_suggestions(&self, prefix: &str, limit: u32) -> Result<Vec<String>> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = format!("{}%", prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_"));
        let conn = self.store.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT title FROM posts WHERE title LIKE ?1 ESCAPE '\\' ORDER BY score DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![pattern, limit as i64], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

// ---- full request flow ----

#[derive(Clone, Debug, PartialEq)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total: u64,
    pub parsed: ParsedSearchQuery,
    pub query: SearchQuery,
}

/// Validate request parameters, extract inline operators from the query text,
/// and run the search. Explicit parameters take precedence over operators.
/// Operator-only queries (no free text left) browse with the operator filters.
pub fn search_archive(
    store: &Store,
    validator: &InputValidator,
    regex: &SafeRegex,
    params: &SearchParams,
) -> std::result::Result<SearchResponse, SearchError> {
    let checked = validator.validate_all(params);
    if !checked.is_valid {
        return Err(SearchError::Validation(checked.errors));
    }
    let s = checked.sanitized;
    let parsed = parse_search_operators(&s.query, regex);

    let mut errors: Vec<FieldError> = Vec::new();
    let subreddit = match s.subreddit {
        Some(sub) => Some(sub),
        None => match parsed.subreddit.as_deref() {
            Some(op) => {
                let c = validator.validate_subreddit(Some(op));
                if let Some(e) = c.error {
                    errors.push(FieldError::new("sub", e));
                }
                c.value
            }
            None => None,
        },
    };
    let author = match s.author {
        Some(a) => Some(a),
        None => match parsed.author.as_deref() {
            Some(op) => {
                let c = validator.validate_author(Some(op));
                if let Some(e) = c.error {
                    errors.push(FieldError::new("author", e));
                }
                c.value
            }
            None => None,
        },
    };
    let min_score = if params.min_score.is_some() {
        s.min_score
    } else {
        let c = validator.validate_score(Some(&IntParam::Num(parsed.min_score)));
        if let Some(e) = c.error {
            errors.push(FieldError::new("score", e));
        }
        c.value.unwrap_or(0)
    };
    if !errors.is_empty() {
        return Err(SearchError::Validation(errors));
    }

    let result_type = s
        .result_type
        .as_deref()
        .or(parsed.result_type.as_deref())
        .and_then(ResultKind::parse);
    let sort_given = params.sort_by.as_deref().map_or(false, |v| !v.trim().is_empty());
    let order_by = if sort_given {
        OrderBy::parse(&s.sort_by)
    } else {
        parsed.sort_by.as_deref().map_or(OrderBy::Rank, OrderBy::parse)
    };

    let has_filters = subreddit.is_some() || author.is_some() || min_score != 0 || result_type.is_some();
    let text = if parsed.query_text.trim().is_empty() && has_filters {
        MATCH_ALL.to_string()
    } else {
        parsed.query_text.clone()
    };

    let query = SearchQuery {
        query_text: text,
        subreddit,
        author,
        result_type,
        min_score,
        start_date: s.start_date,
        end_date: s.end_date,
        limit: s.limit.clamp(1, u32::MAX as i64) as u32,
        offset: s.offset.max(0) as u32,
        order_by,
    };
    let (results, total) = Searcher::new(store).search(&query)?;
    tracing::debug!("search {} -> {} of {}", parsed, results.len(), total);
    Ok(SearchResponse { results, total, parsed, query })
}
