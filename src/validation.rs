//! Whitelisting and bounds checks for every externally supplied search parameter.
//!
//! Each check returns a `FieldCheck` instead of failing fast, so `validate_all`
//! can report every bad field of a request at once.

use crate::error::FieldError;
use time::macros::format_description;
use time::{Date, PrimitiveDateTime, Time};

pub const MAX_QUERY_LENGTH: usize = 500;
pub const SUBREDDIT_MIN: usize = 2;
pub const SUBREDDIT_MAX: usize = 21;
pub const AUTHOR_MIN: usize = 3;
pub const AUTHOR_MAX: usize = 20;
pub const MAX_SCORE_ABS: i64 = 1_000_000;
pub const MIN_LIMIT: i64 = 1;
pub const MAX_LIMIT: i64 = 100;
pub const DEFAULT_LIMIT: i64 = 25;
pub const MAX_OFFSET: i64 = 10_000;
pub const MAX_PAGE_NUMBER: i64 = 1_000;

const SORT_KEYS: &[&str] = &["rank", "score", "date", "new", "old", "created_utc", "created_utc_asc"];

/// `(is_valid, sanitized value, error)` for one field.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldCheck<T> {
    pub is_valid: bool,
    pub value: Option<T>,
    pub error: Option<String>,
}

impl<T> FieldCheck<T> {
    pub fn ok(value: Option<T>) -> Self {
        Self { is_valid: true, value, error: None }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self { is_valid: false, value: None, error: Some(msg.into()) }
    }
}

/// Integer request parameter as it arrives: already numeric, or raw text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntParam {
    Num(i64),
    Text(String),
}

impl From<i64> for IntParam {
    fn from(v: i64) -> Self {
        IntParam::Num(v)
    }
}
impl From<i32> for IntParam {
    fn from(v: i32) -> Self {
        IntParam::Num(v as i64)
    }
}
impl From<&str> for IntParam {
    fn from(v: &str) -> Self {
        IntParam::Text(v.to_string())
    }
}
impl From<String> for IntParam {
    fn from(v: String) -> Self {
        IntParam::Text(v)
    }
}

impl IntParam {
    fn to_int(&self) -> Result<i64, String> {
        match self {
            IntParam::Num(n) => Ok(*n),
            IntParam::Text(s) => s.trim().parse::<i64>().map_err(|_| "must be an integer".to_string()),
        }
    }
}

/// Raw request parameters, all optional.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchParams {
    pub query: Option<String>,
    pub subreddit: Option<String>,
    pub author: Option<String>,
    pub min_score: Option<IntParam>,
    pub result_type: Option<String>,
    pub sort_by: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<IntParam>,
    pub offset: Option<IntParam>,
    pub page: Option<IntParam>,
}

/// Validated, normalized parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct SanitizedParams {
    pub query: String,
    pub subreddit: Option<String>,
    pub author: Option<String>,
    pub min_score: i64,
    pub result_type: Option<String>,
    pub sort_by: String,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for SanitizedParams {
    fn default() -> Self {
        Self {
            query: String::new(),
            subreddit: None,
            author: None,
            min_score: 0,
            result_type: None,
            sort_by: "rank".to_string(),
            start_date: None,
            end_date: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<FieldError>,
    pub sanitized: SanitizedParams,
}

impl ValidationResult {
    /// `"field: message"` for every violation, in field order.
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }

    pub fn first_error(&self) -> Option<String> {
        self.errors.first().map(ToString::to_string)
    }
}

/// Stateless; bounds are the module constants.
#[derive(Clone, Copy, Debug, Default)]
pub struct InputValidator;

impl InputValidator {
    pub fn new() -> Self {
        InputValidator
    }

    /// Trimmed query text; absent or blank is valid and yields "".
    pub fn validate_search_query(&self, query: Option<&str>) -> FieldCheck<String> {
        let q = query.unwrap_or("").trim();
        if q.chars().count() > MAX_QUERY_LENGTH {
            return FieldCheck::err(format!("query too long (max {MAX_QUERY_LENGTH} characters)"));
        }
        if q.contains('\0') {
            return FieldCheck::err("query contains invalid characters");
        }
        if q.chars().any(|c| c.is_control() && c != '\t' && c != '\n') {
            return FieldCheck::err("query contains control characters");
        }
        FieldCheck::ok(Some(q.to_string()))
    }

    /// Case is preserved; absent or blank is valid and yields `None`.
    pub fn validate_subreddit(&self, name: Option<&str>) -> FieldCheck<String> {
        check_name(name, "subreddit", SUBREDDIT_MIN, SUBREDDIT_MAX, |c| c.is_ascii_alphanumeric() || c == '_')
    }

    pub fn validate_author(&self, name: Option<&str>) -> FieldCheck<String> {
        check_name(name, "username", AUTHOR_MIN, AUTHOR_MAX, |c| {
            c.is_ascii_alphanumeric() || c == '_' || c == '-'
        })
    }

    /// Absent means 0.
    pub fn validate_score(&self, score: Option<&IntParam>) -> FieldCheck<i64> {
        bounded_int(score, 0, -MAX_SCORE_ABS, MAX_SCORE_ABS, "score")
    }

    pub fn validate_limit(&self, limit: Option<&IntParam>) -> FieldCheck<i64> {
        bounded_int(limit, DEFAULT_LIMIT, MIN_LIMIT, MAX_LIMIT, "limit")
    }

    pub fn validate_offset(&self, offset: Option<&IntParam>) -> FieldCheck<i64> {
        bounded_int(offset, 0, 0, MAX_OFFSET, "offset")
    }

    /// Converts a 1-based page to an offset: `(page - 1) * limit`.
    pub fn validate_page(&self, page: Option<&IntParam>, limit: i64) -> FieldCheck<i64> {
        let Some(page) = page else { return FieldCheck::ok(Some(0)) };
        let page = match page.to_int() {
            Ok(p) => p,
            Err(e) => return FieldCheck::err(format!("page {e}")),
        };
        if page < 1 {
            return FieldCheck::err("page must be at least 1");
        }
        if page > MAX_PAGE_NUMBER {
            return FieldCheck::err(format!("page number too high (max {MAX_PAGE_NUMBER})"));
        }
        let offset = (page - 1).saturating_mul(limit.max(1));
        if offset > MAX_OFFSET {
            return FieldCheck::err(format!("page exceeds maximum offset ({MAX_OFFSET})"));
        }
        FieldCheck::ok(Some(offset))
    }

    /// `post` or `comment`, case-insensitive; blank means both.
    pub fn validate_result_type(&self, kind: Option<&str>) -> FieldCheck<String> {
        let k = kind.unwrap_or("").trim().to_lowercase();
        match k.as_str() {
            "" => FieldCheck::ok(None),
            "post" | "comment" => FieldCheck::ok(Some(k)),
            _ => FieldCheck::err("invalid result type (expected 'post' or 'comment')"),
        }
    }

    /// Blank defaults to `rank`.
    pub fn validate_sort_by(&self, sort: Option<&str>) -> FieldCheck<String> {
        let s = sort.unwrap_or("").trim().to_lowercase();
        if s.is_empty() {
            return FieldCheck::ok(Some("rank".to_string()));
        }
        if SORT_KEYS.contains(&s.as_str()) {
            FieldCheck::ok(Some(s))
        } else {
            FieldCheck::err(format!("invalid sort option '{s}'"))
        }
    }

    /// Unix seconds, or an ISO date (`YYYY-MM-DD`, UTC midnight). Blank is `None`.
    pub fn validate_date(&self, date: Option<&str>) -> FieldCheck<i64> {
        let d = date.unwrap_or("").trim();
        if d.is_empty() {
            return FieldCheck::ok(None);
        }
        if let Ok(ts) = d.parse::<i64>() {
            return if ts >= 0 { FieldCheck::ok(Some(ts)) } else { FieldCheck::err("date must not be negative") };
        }
        let fmt = format_description!("[year]-[month]-[day]");
        match Date::parse(d, &fmt) {
            Ok(date) => FieldCheck::ok(Some(PrimitiveDateTime::new(date, Time::MIDNIGHT).assume_utc().unix_timestamp())),
            Err(_) => FieldCheck::err("invalid date (expected YYYY-MM-DD or unix seconds)"),
        }
    }

    /// Validate every field and report all violations together.
    /// When both `page` and `offset` are given, `page` decides the offset.
    pub fn validate_all(&self, p: &SearchParams) -> ValidationResult {
        let mut errors = Vec::new();
        let mut s = SanitizedParams::default();

        let mut take = |field: &str, check: FieldCheck<String>| -> Option<String> {
            match check.error {
                Some(msg) => {
                    errors.push(FieldError::new(field, msg));
                    None
                }
                None => check.value,
            }
        };
        s.query = take("query", self.validate_search_query(p.query.as_deref())).unwrap_or_default();
        s.subreddit = take("subreddit", self.validate_subreddit(p.subreddit.as_deref()));
        s.author = take("author", self.validate_author(p.author.as_deref()));
        s.result_type = take("result_type", self.validate_result_type(p.result_type.as_deref()));
        s.sort_by = take("sort_by", self.validate_sort_by(p.sort_by.as_deref())).unwrap_or_else(|| "rank".into());

        let mut take_int = |field: &str, check: FieldCheck<i64>| -> Option<i64> {
            match check.error {
                Some(msg) => {
                    errors.push(FieldError::new(field, msg));
                    None
                }
                None => check.value,
            }
        };
        s.min_score = take_int("min_score", self.validate_score(p.min_score.as_ref())).unwrap_or(0);
        s.start_date = take_int("start_date", self.validate_date(p.start_date.as_deref()));
        s.end_date = take_int("end_date", self.validate_date(p.end_date.as_deref()));
        s.limit = take_int("limit", self.validate_limit(p.limit.as_ref())).unwrap_or(DEFAULT_LIMIT);
        s.offset = if p.page.is_some() {
            take_int("page", self.validate_page(p.page.as_ref(), s.limit)).unwrap_or(0)
        } else {
            take_int("offset", self.validate_offset(p.offset.as_ref())).unwrap_or(0)
        };

        if let (Some(a), Some(b)) = (s.start_date, s.end_date) {
            if a > b {
                errors.push(FieldError::new("end_date", "end_date is before start_date"));
            }
        }

        ValidationResult { is_valid: errors.is_empty(), errors, sanitized: s }
    }
}

fn check_name(
    name: Option<&str>,
    what: &str,
    min: usize,
    max: usize,
    allowed: impl Fn(char) -> bool,
) -> FieldCheck<String> {
    let n = name.unwrap_or("").trim();
    if n.is_empty() {
        return FieldCheck::ok(None);
    }
    let len = n.chars().count();
    if len < min {
        return FieldCheck::err(format!("{what} too short (min {min} characters)"));
    }
    if len > max {
        return FieldCheck::err(format!("{what} too long (max {max} characters)"));
    }
    if !n.chars().all(allowed) {
        return FieldCheck::err(format!("{what} contains invalid characters"));
    }
    FieldCheck::ok(Some(n.to_string()))
}

fn bounded_int(v: Option<&IntParam>, default: i64, min: i64, max: i64, what: &str) -> FieldCheck<i64> {
    let Some(v) = v else { return FieldCheck::ok(Some(default)) };
    match v.to_int() {
        Err(e) => FieldCheck::err(format!("{what} {e}")),
        Ok(n) if n < min || n > max => FieldCheck::err(format!("{what} out of range ({min} to {max})")),
        Ok(n) => FieldCheck::ok(Some(n)),
    }
}

pub fn is_valid_subreddit(name: &str) -> bool {
    let c = InputValidator::new().validate_subreddit(Some(name));
    c.is_valid && c.value.is_some()
}

pub fn is_valid_author(name: &str) -> bool {
    let c = InputValidator::new().validate_author(Some(name));
    c.is_valid && c.value.is_some()
}

/// Sanitized query text, or `None` when it is unacceptable.
pub fn sanitize_query(query: &str) -> Option<String> {
    InputValidator::new().validate_search_query(Some(query)).value
}
