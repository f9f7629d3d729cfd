//! Typed conditions callers are expected to match on.
//!
//! Everything else travels as `anyhow::Error` with context attached; these enums
//! are the cases where the caller's behavior differs by kind (not-found is fatal
//! for the invocation, a halt is resumable, validation is reported per field).

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    /// No matching archive files, or a path the caller named does not exist.
    #[error("not found: {what} ({})", .path.display())]
    NotFound { path: PathBuf, what: String },

    /// A record family tag other than `posts` / `comments`.
    #[error("invalid record_type '{0}': expected 'posts' or 'comments'")]
    InvalidRecordType(String),

    /// Unknown platform identifier.
    #[error("unknown platform '{0}'")]
    UnknownPlatform(String),
}

impl ArchiveError {
    pub fn not_found(path: impl Into<PathBuf>, what: impl Into<String>) -> Self {
        Self::NotFound { path: path.into(), what: what.into() }
    }
}

/// Reasons a run stops before finishing its units. Both are resumable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Halt {
    #[error("shutdown requested")]
    Interrupted,

    #[error("memory usage at {:.1}% of the configured ceiling", .fraction * 100.0)]
    MemoryEmergency { fraction: f64 },
}

/// Returns the `Halt` carried by an error chain, if any.
pub fn as_halt(err: &anyhow::Error) -> Option<&Halt> {
    err.chain().find_map(|e| e.downcast_ref::<Halt>())
}

/// One rejected request field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug)]
pub enum SearchError {
    /// Request parameters failed validation; nothing reached the store.
    #[error("invalid search parameters: {}", join_fields(.0))]
    Validation(Vec<FieldError>),

    #[error("search failed: {0}")]
    Store(#[from] anyhow::Error),
}

fn join_fields(errors: &[FieldError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}
