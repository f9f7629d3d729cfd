mod config;
mod error;
mod util;
mod mem;
mod progress;
mod shutdown;

mod safe_regex;
mod validation;
mod operators;

mod records;
mod decoder;
mod importer;
mod reddit;
mod ruqqus;

mod store;
mod loader;
mod search;

mod processor;
mod ingest;
mod filter;
mod integrity;

pub use crate::config::{ArtifactPolicy, IngestOptions};
pub use crate::error::{as_halt, ArchiveError, FieldError, Halt, SearchError};

// Streaming decode and per-platform normalization.
pub use crate::decoder::{Codec, DecodeCfg, DecodedLine, StreamDecoder};
pub use crate::importer::{CommunityFilter, DetectedFiles, Platform, RecordStream, StreamCounts};
pub use crate::records::{Authored, CanonicalComment, CanonicalPost, Normalized, SkipReason};

// Storage and search.
pub use crate::loader::{BatchOutcome, BulkLoader};
pub use crate::search::{
    compile_match, search_archive, OrderBy, ResultKind, SearchQuery, SearchResponse, SearchResult, Searcher, MATCH_ALL,
};
pub use crate::store::{DatabaseInfo, Store};

// Query-side input handling.
pub use crate::operators::{
    escape_html, format_search_breadcrumb, parse_search_operators, search_tips_html, ParsedSearchQuery,
    MAX_OPERATOR_INPUT,
};
pub use crate::safe_regex::{RegexFlags, SafeRegex, DEFAULT_TIMEOUT};
pub use crate::validation::{
    is_valid_author, is_valid_subreddit, sanitize_query, FieldCheck, InputValidator, IntParam, SanitizedParams,
    SearchParams, ValidationResult,
};

// Orchestration.
pub use crate::ingest::{ingest_file, user_page_path, ArchiveWorker, IngestStats, RecordKind, UserPageRenderer};
pub use crate::processor::{
    Checkpoint, IncrementalProcessor, NoCheckpoint, Phase, ProgressState, ResumeStrategy, RunOutcome, RunSummary,
    UnitReport, UnitWorker, UserActivity, PROGRESS_FILE_NAME,
};
pub use crate::shutdown::{install_signal_handler, ShutdownToken};

// Memory and progress helpers for the binary.
pub use crate::mem::{available_memory_fraction, MemoryLevel, MemorySampler, MemoryThresholds, ProcessMemory};
pub use crate::progress::{make_count_progress, make_progress_bar_labeled, set_global_multiprogress, ProgressScope};

// Archive maintenance tools.
pub use crate::filter::{filter_archive, load_subreddits_from_file, ArchiveFilter, FilterStats};
pub use crate::integrity::{check_archive_integrity, quick_validate_zst, validate_zst_full, IntegrityMode};

pub use crate::util::{format_gb, init_tracing_once, write_json_atomic};
