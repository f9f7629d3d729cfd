//! Resumable, memory-aware orchestration of a multi-subreddit ingestion run.
//!
//! Phases: `initialization -> subreddit_processing -> user_page_generation -> complete`,
//! with the resumable side exits `interrupted` and `emergency_oom_shutdown`.
//! Progress is persisted to `<output_dir>/.archive-progress.json` after every unit
//! of work; a unit stays in `remaining_subreddits` until it has finished, so any
//! halt re-runs at most the unit in flight (inserts are idempotent).

use crate::error::{as_halt, Halt};
use crate::mem::{available_memory_fraction, ceiling_bytes, MemoryLevel, MemorySampler, MemoryThresholds, ProcessMemory};
use crate::progress::ProgressScope;
use crate::shutdown::ShutdownToken;
use crate::util::{format_gb, normalize_community, write_json_atomic};
use ahash::{AHashMap, AHashSet};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const PROGRESS_FILE_NAME: &str = ".archive-progress.json";
const STATE_VERSION: u32 = 1;

// ---- phases and persisted state ----

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Phase {
    #[default]
    Initialization,
    SubredditProcessing,
    UserPageGeneration,
    Complete,
    Interrupted,
    EmergencyOomShutdown,
    /// Unrecognized tag read from disk (or written by a collaborator).
    Other(String),
}

impl Phase {
    pub fn as_str(&self) -> &str {
        match self {
            Phase::Initialization => "initialization",
            Phase::SubredditProcessing => "subreddit_processing",
            Phase::UserPageGeneration => "user_page_generation",
            Phase::Complete => "complete",
            Phase::Interrupted => "interrupted",
            Phase::EmergencyOomShutdown => "emergency_oom_shutdown",
            Phase::Other(s) => s,
        }
    }
}

impl From<String> for Phase {
    fn from(s: String) -> Self {
        match s.as_str() {
            "initialization" => Phase::Initialization,
            "subreddit_processing" => Phase::SubredditProcessing,
            "user_page_generation" => Phase::UserPageGeneration,
            "complete" => Phase::Complete,
            "interrupted" => Phase::Interrupted,
            "emergency_oom_shutdown" => Phase::EmergencyOomShutdown,
            _ => Phase::Other(s),
        }
    }
}

impl From<&str> for Phase {
    fn from(s: &str) -> Self {
        Phase::from(s.to_string())
    }
}

impl From<Phase> for String {
    fn from(p: Phase) -> Self {
        p.as_str().to_string()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn state_version() -> u32 {
    STATE_VERSION
}

/// On-disk checkpoint. Every field but `phase` may be missing from older files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    #[serde(default = "state_version")]
    pub version: u32,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub completed_subreddits: Vec<String>,
    #[serde(default)]
    pub remaining_subreddits: Vec<String>,
    #[serde(default)]
    pub failed_subreddits: Vec<String>,
    #[serde(default)]
    pub current_subreddit: Option<String>,
    #[serde(default)]
    pub total_subreddits: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_emergency: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage_at_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeStrategy {
    StartFresh,
    AlreadyComplete,
    ResumeSubreddits,
    ResumeFromEmergency,
    ResumeUsers,
}

impl ResumeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ResumeStrategy::StartFresh => "start_fresh",
            ResumeStrategy::AlreadyComplete => "already_complete",
            ResumeStrategy::ResumeSubreddits => "resume_subreddits",
            ResumeStrategy::ResumeFromEmergency => "resume_from_emergency",
            ResumeStrategy::ResumeUsers => "resume_users",
        }
    }

    fn for_phase(phase: &Phase) -> ResumeStrategy {
        match phase {
            Phase::Complete => ResumeStrategy::AlreadyComplete,
            Phase::EmergencyOomShutdown => ResumeStrategy::ResumeFromEmergency,
            Phase::UserPageGeneration => ResumeStrategy::ResumeUsers,
            // subreddit_processing, interrupted, and anything unrecognized
            _ => ResumeStrategy::ResumeSubreddits,
        }
    }
}

// ---- user activity ----

/// Authors seen while ingesting, for the user-page phase.
#[derive(Clone, Debug, Default)]
pub struct UserActivity {
    pub total_unique_users: AHashSet<String>,
    pub users_by_subreddit: AHashMap<String, AHashSet<String>>,
    pub high_activity_users: AHashSet<String>,
    pub user_pages_generated: bool,
    record_counts: AHashMap<String, u64>,
    high_activity_threshold: u64,
}

impl UserActivity {
    pub fn new(high_activity_threshold: u64) -> Self {
        Self { high_activity_threshold: high_activity_threshold.max(1), ..Self::default() }
    }

    /// Deleted and removed accounts are not tracked.
    pub fn record(&mut self, subreddit: &str, author: &str) {
        self.record_many(subreddit, author, 1);
    }

    /// Forget everything tracked; the threshold is kept.
    pub fn clear(&mut self) {
        *self = Self::new(self.high_activity_threshold);
    }

    /// Count `n` records by `author` at once.
    pub fn record_many(&mut self, subreddit: &str, author: &str, n: u64) {
        if n == 0 || author.is_empty() || author == "[deleted]" || author == "[removed]" {
            return;
        }
        if !self.total_unique_users.contains(author) {
            self.total_unique_users.insert(author.to_string());
        }
        self.users_by_subreddit
            .entry(subreddit.to_lowercase())
            .or_default()
            .insert(author.to_string());
        let total = self.record_counts.entry(author.to_string()).or_insert(0);
        *total += n;
        if *total >= self.high_activity_threshold.max(1) {
            self.high_activity_users.insert(author.to_string());
        }
    }

    pub fn records_by(&self, author: &str) -> u64 {
        self.record_counts.get(author).copied().unwrap_or(0)
    }
}

// ---- worker seam ----

/// Consulted by long-running work between batches. An `Err` carrying a `Halt`
/// asks the caller to stop and unwind.
pub trait Checkpoint {
    fn checkpoint(&mut self) -> Result<()>;
}

/// Never halts.
pub struct NoCheckpoint;

impl Checkpoint for NoCheckpoint {
    fn checkpoint(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Checkpoint for ShutdownToken {
    fn checkpoint(&mut self) -> Result<()> {
        if self.is_requested() {
            return Err(Halt::Interrupted.into());
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnitReport {
    pub records: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Per-subreddit work driven by `IncrementalProcessor::run`.
pub trait UnitWorker {
    fn process_unit(
        &mut self,
        subreddit: &str,
        activity: &mut UserActivity,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<UnitReport>;

    /// Re-derive activity for units an earlier run already finished; the
    /// in-memory activity does not survive a restart.
    fn rebuild_activity(&mut self, _completed: &[String], _activity: &mut UserActivity) -> Result<()> {
        Ok(())
    }

    /// Returns the number of pages written.
    fn generate_user_pages(&mut self, _activity: &UserActivity, _checkpoint: &mut dyn Checkpoint) -> Result<usize> {
        Ok(0)
    }
}

// ---- run summary ----

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Completed,
    AlreadyComplete,
    Halted(Halt),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub remaining: Vec<String>,
    pub records_processed: u64,
    pub records_failed: u64,
    pub records_skipped: u64,
    pub user_pages: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed | RunOutcome::AlreadyComplete) && self.failed.is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &self.outcome {
            RunOutcome::Completed => "completed".to_string(),
            RunOutcome::AlreadyComplete => "already complete (nothing to do)".to_string(),
            RunOutcome::Halted(h) => format!("halted: {h} (resumable)"),
        };
        writeln!(f, "Run {status} in {:.1}s", self.elapsed.as_secs_f64())?;
        writeln!(
            f,
            "  subreddits : {} completed, {} failed, {} remaining",
            self.completed.len(),
            self.failed.len(),
            self.remaining.len()
        )?;
        writeln!(
            f,
            "  records    : {} processed, {} failed, {} skipped",
            self.records_processed, self.records_failed, self.records_skipped
        )?;
        write!(f, "  user pages : {}", self.user_pages)?;
        if !self.failed.is_empty() {
            write!(f, "\n  failed     : {}", self.failed.join(", "))?;
        }
        Ok(())
    }
}

// ---- processor ----

type ReclaimHook = Box<dyn FnMut() + Send>;

pub struct IncrementalProcessor {
    output_dir: PathBuf,
    progress_file: PathBuf,
    max_memory_bytes: Option<u64>,
    thresholds: MemoryThresholds,
    sampler: Option<Box<dyn MemorySampler>>,
    reclaim_hooks: Vec<ReclaimHook>,
    last_rss: u64,
    last_level: MemoryLevel,
    collections_forced: u64,
    current_phase: Phase,
    start_time: OffsetDateTime,
    shutdown: ShutdownToken,
    progress: bool,

    pub completed_subreddits: Vec<String>,
    pub remaining_subreddits: Vec<String>,
    pub failed_subreddits: Vec<String>,
    pub current_subreddit: Option<String>,
    pub total_subreddits: usize,
    pub user_activity: UserActivity,
}

fn absolute(dir: &Path) -> Result<PathBuf> {
    // rebuilding from components drops a trailing separator
    let clean: PathBuf = dir.components().collect();
    if clean.is_absolute() {
        Ok(clean)
    } else {
        Ok(std::env::current_dir().context("resolve current directory")?.join(clean))
    }
}

impl IncrementalProcessor {
    /// `max_memory_gb <= 0` disables memory monitoring.
    pub fn new(output_dir: impl AsRef<Path>, max_memory_gb: f64) -> Result<Self> {
        let output_dir = absolute(output_dir.as_ref())?;
        fs::create_dir_all(&output_dir).with_context(|| format!("create {}", output_dir.display()))?;
        let max_memory_bytes = ceiling_bytes(max_memory_gb);
        let sampler: Option<Box<dyn MemorySampler>> = match max_memory_bytes {
            None => None,
            Some(_) => match ProcessMemory::new() {
                Ok(s) => Some(Box::new(s)),
                Err(e) => {
                    tracing::warn!("memory monitoring unavailable: {}", e);
                    None
                }
            },
        };
        if let Some(limit) = max_memory_bytes {
            tracing::info!("memory ceiling {}", format_gb(limit));
        }
        Ok(Self {
            progress_file: output_dir.join(PROGRESS_FILE_NAME),
            output_dir,
            max_memory_bytes,
            thresholds: MemoryThresholds::default(),
            sampler,
            reclaim_hooks: Vec::new(),
            last_rss: 0,
            last_level: MemoryLevel::Normal,
            collections_forced: 0,
            current_phase: Phase::Initialization,
            start_time: OffsetDateTime::now_utc(),
            shutdown: ShutdownToken::new(),
            progress: false,
            completed_subreddits: Vec::new(),
            remaining_subreddits: Vec::new(),
            failed_subreddits: Vec::new(),
            current_subreddit: None,
            total_subreddits: 0,
            user_activity: UserActivity::new(100),
        })
    }

    pub fn with_sampler(mut self, sampler: Box<dyn MemorySampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_thresholds(mut self, thresholds: MemoryThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_shutdown_token(mut self, token: ShutdownToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }

    pub fn with_high_activity_threshold(mut self, n: u64) -> Self {
        self.user_activity = UserActivity::new(n);
        self
    }

    /// Run `hook` whenever a reclamation pass is forced (critical pressure or
    /// proactive cleanup). Hooks should drop caches and shrink buffers.
    pub fn add_reclaim_hook(&mut self, hook: impl FnMut() + Send + 'static) {
        self.reclaim_hooks.push(Box::new(hook));
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
    pub fn progress_file(&self) -> &Path {
        &self.progress_file
    }
    pub fn phase(&self) -> &Phase {
        &self.current_phase
    }
    pub fn thresholds(&self) -> MemoryThresholds {
        self.thresholds
    }
    pub fn memory_monitoring_enabled(&self) -> bool {
        self.max_memory_bytes.is_some()
    }
    /// `None` means unbounded.
    pub fn max_memory_bytes(&self) -> Option<u64> {
        self.max_memory_bytes
    }
    pub fn start_time(&self) -> OffsetDateTime {
        self.start_time
    }
    pub fn collections_forced(&self) -> u64 {
        self.collections_forced
    }
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_requested()
    }

    /// What the interrupt handler calls. Progress is persisted at the next checkpoint.
    pub fn request_shutdown(&self) {
        tracing::warn!("shutdown requested; progress will be saved at the next checkpoint");
        self.shutdown.request();
    }

    // ---- persisted state ----

    /// Pure function of the progress file.
    pub fn detect_processing_state(&self) -> Result<(ResumeStrategy, Option<ProgressState>)> {
        let text = match fs::read_to_string(&self.progress_file) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((ResumeStrategy::StartFresh, None)),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.progress_file.display())),
        };
        match serde_json::from_str::<ProgressState>(&text) {
            Ok(state) => Ok((ResumeStrategy::for_phase(&state.phase), Some(state))),
            Err(e) => {
                tracing::warn!(
                    "ignoring unreadable progress file {} ({}); starting fresh",
                    self.progress_file.display(),
                    e
                );
                Ok((ResumeStrategy::StartFresh, None))
            }
        }
    }

    pub fn snapshot(&self, is_emergency: bool) -> ProgressState {
        let timestamp = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        ProgressState {
            version: STATE_VERSION,
            phase: self.current_phase.clone(),
            timestamp,
            completed_subreddits: self.completed_subreddits.clone(),
            remaining_subreddits: self.remaining_subreddits.clone(),
            failed_subreddits: self.failed_subreddits.clone(),
            current_subreddit: self.current_subreddit.clone(),
            total_subreddits: self.total_subreddits,
            is_emergency: is_emergency.then_some(true),
            memory_usage_at_failure: is_emergency.then(|| format_gb(self.last_rss)),
            memory_limit: is_emergency
                .then(|| self.max_memory_bytes.map_or_else(|| "unlimited".to_string(), format_gb)),
        }
    }

    /// Atomically rewrite the progress file with `phase` and the current lists.
    pub fn save_progress_state(&mut self, phase: impl Into<Phase>, is_emergency: bool) -> Result<()> {
        self.current_phase = phase.into();
        let state = self.snapshot(is_emergency);
        write_json_atomic(&self.progress_file, &state)?;
        tracing::debug!(
            "progress saved: phase={} completed={} remaining={} failed={}",
            state.phase,
            state.completed_subreddits.len(),
            state.remaining_subreddits.len(),
            state.failed_subreddits.len()
        );
        Ok(())
    }

    fn restore(&mut self, state: &ProgressState) {
        self.completed_subreddits = state.completed_subreddits.clone();
        self.remaining_subreddits = state.remaining_subreddits.clone();
        self.failed_subreddits = state.failed_subreddits.clone();
        self.current_subreddit = None;
        // a unit that was in flight goes back to the front of the queue
        if let Some(cur) = &state.current_subreddit {
            let seen = self.completed_subreddits.contains(cur)
                || self.failed_subreddits.contains(cur)
                || self.remaining_subreddits.contains(cur);
            if !seen {
                self.remaining_subreddits.insert(0, cur.clone());
            }
        }
        self.total_subreddits = state
            .total_subreddits
            .max(self.completed_subreddits.len() + self.remaining_subreddits.len() + self.failed_subreddits.len());
        self.current_phase = state.phase.clone();
    }

    // ---- memory ----

    /// Current resident memory as a fraction of the ceiling, in `[0, 1]`.
    /// 0 when monitoring is disabled or the sample fails.
    pub fn check_memory_usage(&mut self) -> f64 {
        let Some(limit) = self.max_memory_bytes else { return 0.0 };
        let Some(sampler) = self.sampler.as_mut() else { return 0.0 };
        match sampler.resident_bytes() {
            Ok(rss) => {
                self.last_rss = rss;
                if limit == 0 {
                    return 0.0;
                }
                (rss as f64 / limit as f64).clamp(0.0, 1.0)
            }
            Err(e) => {
                tracing::debug!("memory sample failed: {}", e);
                0.0
            }
        }
    }

    fn force_reclaim(&mut self) {
        for hook in self.reclaim_hooks.iter_mut() {
            hook();
        }
        self.collections_forced += 1;
    }

    /// Apply the threshold ladder to `fraction`. At the emergency level the
    /// emergency state is persisted before returning.
    pub fn handle_memory_fraction(&mut self, fraction: f64) -> Result<MemoryLevel> {
        let level = self.thresholds.level(fraction);
        let pct = fraction * 100.0;
        match level {
            MemoryLevel::Normal => {}
            MemoryLevel::Info => {
                if self.last_level < MemoryLevel::Info {
                    tracing::info!("memory at {:.1}% of ceiling", pct);
                }
            }
            MemoryLevel::Warning => {
                tracing::warn!("memory at {:.1}% of ceiling; reclaiming between units", pct);
            }
            MemoryLevel::Critical => {
                tracing::warn!("memory at {:.1}% of ceiling (critical); forcing reclamation", pct);
                self.force_reclaim();
            }
            MemoryLevel::Emergency => {
                tracing::error!(
                    "memory at {:.1}% of ceiling ({:.0}% of system memory free); saving emergency state and stopping",
                    pct,
                    available_memory_fraction() * 100.0
                );
                self.save_progress_state(Phase::EmergencyOomShutdown, true)?;
            }
        }
        self.last_level = level;
        Ok(level)
    }

    pub fn monitor_memory(&mut self) -> Result<MemoryLevel> {
        let f = self.check_memory_usage();
        self.handle_memory_fraction(f)
    }

    /// Force a reclamation pass and return the memory fraction afterwards.
    pub fn trigger_proactive_cleanup(&mut self) -> f64 {
        self.force_reclaim();
        let after = self.check_memory_usage();
        tracing::debug!("proactive cleanup: memory now at {:.1}% of ceiling", after * 100.0);
        after
    }

    // ---- run ----

    fn summary(&self, outcome: RunOutcome, totals: UnitReport, user_pages: usize, started: Instant) -> RunSummary {
        RunSummary {
            outcome,
            completed: self.completed_subreddits.clone(),
            failed: self.failed_subreddits.clone(),
            remaining: self.remaining_subreddits.clone(),
            records_processed: totals.records,
            records_failed: totals.failed,
            records_skipped: totals.skipped,
            user_pages,
            elapsed: started.elapsed(),
        }
    }

    fn halt(&mut self, halt: Halt, totals: UnitReport, started: Instant) -> Result<RunSummary> {
        match &halt {
            Halt::Interrupted => self.save_progress_state(Phase::Interrupted, false)?,
            Halt::MemoryEmergency { .. } => self.save_progress_state(Phase::EmergencyOomShutdown, true)?,
        }
        tracing::warn!("run halted ({}); progress saved to {}", halt, self.progress_file.display());
        Ok(self.summary(RunOutcome::Halted(halt), totals, 0, started))
    }

    fn start_fresh(&mut self, subreddits: &[String]) {
        let mut seen = AHashSet::new();
        self.remaining_subreddits = subreddits
            .iter()
            .map(|s| normalize_community(s))
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();
        self.completed_subreddits.clear();
        self.failed_subreddits.clear();
        self.current_subreddit = None;
        self.total_subreddits = self.remaining_subreddits.len();
    }

    /// Drive `worker` over `subreddits`, resuming from the progress file when one exists.
    pub fn run(&mut self, subreddits: &[String], worker: &mut dyn UnitWorker) -> Result<RunSummary> {
        let started = Instant::now();
        let mut totals = UnitReport::default();
        let (strategy, saved) = self.detect_processing_state()?;
        tracing::info!("resume strategy: {}", strategy.as_str());

        match (strategy, saved) {
            (ResumeStrategy::AlreadyComplete, saved) => {
                if let Some(s) = saved {
                    self.restore(&s);
                }
                tracing::info!("previous run already complete; nothing to do");
                return Ok(self.summary(RunOutcome::AlreadyComplete, totals, 0, started));
            }
            (ResumeStrategy::StartFresh, _) | (_, None) => self.start_fresh(subreddits),
            (strategy, Some(s)) => {
                self.restore(&s);
                // units requested now but unknown to the saved run are appended
                for sub in subreddits.iter().map(|s| normalize_community(s)) {
                    let known = self.completed_subreddits.contains(&sub)
                        || self.failed_subreddits.contains(&sub)
                        || self.remaining_subreddits.contains(&sub);
                    if !sub.is_empty() && !known {
                        self.remaining_subreddits.push(sub);
                        self.total_subreddits += 1;
                    }
                }
                if strategy == ResumeStrategy::ResumeFromEmergency {
                    let f = self.trigger_proactive_cleanup();
                    tracing::info!(
                        "resuming after emergency shutdown: {} remaining, memory at {:.1}%",
                        self.remaining_subreddits.len(),
                        f * 100.0
                    );
                }
            }
        }

        if strategy != ResumeStrategy::StartFresh && !self.completed_subreddits.is_empty() {
            let completed = self.completed_subreddits.clone();
            self.user_activity.clear();
            worker
                .rebuild_activity(&completed, &mut self.user_activity)
                .context("rebuild user activity for completed subreddits")?;
            tracing::info!(
                "rebuilt activity for {} completed subreddit(s): {} users",
                completed.len(),
                self.user_activity.total_unique_users.len()
            );
        }

        if strategy != ResumeStrategy::ResumeUsers {
            self.save_progress_state(Phase::SubredditProcessing, false)?;
            let pb = ProgressScope::count("Subreddits", self.total_subreddits as u64, self.progress);
            pb.inc(self.completed_subreddits.len() as u64 + self.failed_subreddits.len() as u64);

            while let Some(sub) = self.remaining_subreddits.first().cloned() {
                if self.shutdown.is_requested() {
                    return self.halt(Halt::Interrupted, totals, started);
                }
                self.current_subreddit = Some(sub.clone());
                pb.set_message(sub.clone());

                let mut activity = std::mem::take(&mut self.user_activity);
                let res = worker.process_unit(&sub, &mut activity, self);
                self.user_activity = activity;

                match res {
                    Ok(report) => {
                        totals.records += report.records;
                        totals.failed += report.failed;
                        totals.skipped += report.skipped;
                        self.remaining_subreddits.remove(0);
                        self.completed_subreddits.push(sub.clone());
                        tracing::info!("r/{}: {} records ({} failed)", sub, report.records, report.failed);
                    }
                    Err(e) => {
                        if let Some(h) = as_halt(&e) {
                            self.current_subreddit = None;
                            return self.halt(h.clone(), totals, started);
                        }
                        tracing::error!("r/{} failed: {:#}", sub, e);
                        self.remaining_subreddits.remove(0);
                        self.failed_subreddits.push(sub.clone());
                    }
                }
                self.current_subreddit = None;
                self.save_progress_state(Phase::SubredditProcessing, false)?;
                pb.inc(1);

                if let Err(e) = Checkpoint::checkpoint(self) {
                    return match as_halt(&e) {
                        Some(h) => self.halt(h.clone(), totals, started),
                        None => Err(e),
                    };
                }
                if self.last_level >= MemoryLevel::Warning {
                    self.trigger_proactive_cleanup();
                }
            }
            pb.finish("Subreddits done");
        }

        self.save_progress_state(Phase::UserPageGeneration, false)?;
        let activity = std::mem::take(&mut self.user_activity);
        let pages = worker.generate_user_pages(&activity, self);
        self.user_activity = activity;
        let user_pages = match pages {
            Ok(n) => {
                self.user_activity.user_pages_generated = true;
                n
            }
            Err(e) => {
                if let Some(h) = as_halt(&e) {
                    return self.halt(h.clone(), totals, started);
                }
                return Err(e.context("user page generation failed"));
            }
        };

        self.save_progress_state(Phase::Complete, false)?;
        let summary = self.summary(RunOutcome::Completed, totals, user_pages, started);
        tracing::info!("{}", summary);
        Ok(summary)
    }
}

impl Checkpoint for IncrementalProcessor {
    fn checkpoint(&mut self) -> Result<()> {
        if self.shutdown.is_requested() {
            return Err(Halt::Interrupted.into());
        }
        let fraction = self.check_memory_usage();
        if self.handle_memory_fraction(fraction)? == MemoryLevel::Emergency {
            return Err(Halt::MemoryEmergency { fraction }.into());
        }
        Ok(())
    }
}
