//! Stream archive files into the store: decode -> normalize -> batch -> flush.

use crate::config::{ArtifactPolicy, IngestOptions};
use crate::decoder::{DecodeCfg, StreamDecoder};
use crate::error::ArchiveError;
use crate::importer::{CommunityFilter, DetectedFiles, Platform, StreamCounts};
use crate::loader::{BatchOutcome, BulkLoader};
use crate::processor::{Checkpoint, UnitReport, UnitWorker, UserActivity};
use crate::progress::ProgressScope;
use crate::records::{Authored, Normalized};
use ahash::AHashSet;
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Posts,
    Comments,
}

impl RecordKind {
    pub fn parse(s: &str) -> Result<RecordKind, ArchiveError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "posts" => Ok(RecordKind::Posts),
            "comments" => Ok(RecordKind::Comments),
            _ => Err(ArchiveError::InvalidRecordType(s.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Posts => "posts",
            RecordKind::Comments => "comments",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IngestStats {
    /// Rows actually written.
    pub records_processed: u64,
    pub records_filtered: u64,
    /// Unparseable lines plus records missing a required field.
    pub bad_lines: u64,
    pub total_lines: u64,
    pub records_failed: u64,
    pub duplicates: u64,
    pub processing_time: Duration,
    pub records_per_second: f64,
    pub database_size_mb: f64,
}

impl IngestStats {
    fn absorb_batch(&mut self, out: &BatchOutcome) {
        self.records_processed += out.successful as u64;
        self.records_failed += out.failed as u64;
        self.duplicates += out.duplicates as u64;
    }

    fn absorb_counts(&mut self, c: &StreamCounts) {
        self.total_lines = c.total_lines;
        self.records_filtered = c.filtered;
        self.bad_lines = c.bad_lines + c.incomplete;
    }

    /// Sum of several files' stats; rate and size are recomputed by the caller.
    pub fn merge(&mut self, other: &IngestStats) {
        self.records_processed += other.records_processed;
        self.records_filtered += other.records_filtered;
        self.bad_lines += other.bad_lines;
        self.total_lines += other.total_lines;
        self.records_failed += other.records_failed;
        self.duplicates += other.duplicates;
        self.processing_time += other.processing_time;
    }
}

/// Stream one archive file into the store.
///
/// `checkpoint` is consulted after every flushed batch; a `Halt` it returns is
/// propagated once the batch in flight has been committed.
#[allow(clippy::too_many_arguments)]
pub fn ingest_file(
    loader: &BulkLoader<'_>,
    path: &Path,
    platform: Platform,
    kind: RecordKind,
    opts: &IngestOptions,
    filter: Option<&CommunityFilter>,
    checkpoint: &mut dyn Checkpoint,
    activity: Option<&mut UserActivity>,
) -> Result<IngestStats> {
    if !path.is_file() {
        return Err(ArchiveError::not_found(path, format!("{kind} archive")).into());
    }
    let cfg = DecodeCfg::from(opts);
    let filter = filter.filter(|f| !f.is_empty());
    let mut stats = match kind {
        RecordKind::Posts => load_stream(
            path,
            &cfg,
            opts,
            filter,
            checkpoint,
            activity,
            |l| platform.normalize_post_line(l),
            |b| loader.insert_posts_batch(b),
        )?,
        RecordKind::Comments => load_stream(
            path,
            &cfg,
            opts,
            filter,
            checkpoint,
            activity,
            |l| platform.normalize_comment_line(l),
            |b| loader.insert_comments_batch(b),
        )?,
    };
    stats.database_size_mb = loader.store().database_info().map(|i| i.db_size_mb).unwrap_or(0.0);
    tracing::info!(
        "{} {}: {} written, {} duplicate, {} failed, {} filtered, {} bad of {} lines ({:.0} rec/s)",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("?"),
        kind,
        stats.records_processed,
        stats.duplicates,
        stats.records_failed,
        stats.records_filtered,
        stats.bad_lines,
        stats.total_lines,
        stats.records_per_second
    );
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
fn load_stream<T: Authored + Send>(
    path: &Path,
    cfg: &DecodeCfg,
    opts: &IngestOptions,
    filter: Option<&CommunityFilter>,
    checkpoint: &mut dyn Checkpoint,
    mut activity: Option<&mut UserActivity>,
    normalize: impl Fn(&str) -> Normalized<T> + Sync,
    insert: impl Fn(&[T]) -> Result<BatchOutcome>,
) -> Result<IngestStats> {
    let started = Instant::now();
    let mut decoder = StreamDecoder::open(path, cfg)?;
    let total_bytes = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let label = path.file_name().and_then(|n| n.to_str()).unwrap_or("archive").to_string();
    let pb = ProgressScope::bytes(label, total_bytes, opts.progress);

    let batch_size = opts.batch_size.max(1);
    let mut counts = StreamCounts::default();
    let mut stats = IngestStats::default();
    let mut raw: Vec<String> = Vec::with_capacity(batch_size);

    loop {
        raw.clear();
        for line in decoder.by_ref().take(batch_size) {
            raw.push(line.text);
        }
        if raw.is_empty() {
            break;
        }

        // normalization is CPU-bound and order-preserving under par_iter
        let normalized: Vec<Normalized<T>> = raw.par_iter().map(|l| normalize(l)).collect();
        let batch: Vec<T> = normalized.into_iter().filter_map(|n| counts.observe(n, filter)).collect();

        if !batch.is_empty() {
            let out = insert(&batch).with_context(|| format!("flush batch from {}", path.display()))?;
            if let Some(act) = activity.as_deref_mut() {
                // rejected rows are not in the store; duplicates are
                let failed: AHashSet<&str> = out.failed_ids.iter().map(String::as_str).collect();
                for rec in batch.iter().filter(|r| !failed.contains(r.id())) {
                    act.record(rec.subreddit(), rec.author());
                }
            }
            if out.failed > 0 {
                tracing::debug!("{} record(s) rejected, e.g. {:?}", out.failed, out.failed_ids.first());
            }
            stats.absorb_batch(&out);
        }
        pb.set_position(decoder.compressed_bytes_read());
        checkpoint.checkpoint()?;
    }

    pb.finish("done");
    stats.absorb_counts(&counts);
    stats.processing_time = started.elapsed();
    let secs = stats.processing_time.as_secs_f64();
    stats.records_per_second = if secs > 0.0 { stats.records_processed as f64 / secs } else { 0.0 };
    Ok(stats)
}

// ---- per-subreddit worker ----

/// Renders one user page. Page layout lives outside this crate.
pub trait UserPageRenderer {
    fn render_user_page(&mut self, author: &str, activity: &UserActivity, dest: &Path) -> Result<()>;
}

/// Ingests every archive file for one subreddit (posts before comments), then
/// hands user pages to an optional renderer.
pub struct ArchiveWorker<'a> {
    loader: BulkLoader<'a>,
    files: DetectedFiles,
    opts: IngestOptions,
    policy: ArtifactPolicy,
    renderer: Option<Box<dyn UserPageRenderer + 'a>>,
    totals: IngestStats,
}

impl<'a> ArchiveWorker<'a> {
    pub fn new(loader: BulkLoader<'a>, files: DetectedFiles, opts: IngestOptions) -> Self {
        let policy = opts.artifact_policy();
        Self { loader, files, opts, policy, renderer: None, totals: IngestStats::default() }
    }

    pub fn with_renderer(mut self, renderer: Box<dyn UserPageRenderer + 'a>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Stats summed over every file ingested so far.
    pub fn totals(&self) -> &IngestStats {
        &self.totals
    }

    /// Per-subreddit dumps (`<name>_submissions.zst`, `<name>_comments_2006-01.zst`)
    /// are used directly when present; otherwise every file of the family is
    /// scanned with a filter.
    fn files_for<'f>(files: &'f [PathBuf], subreddit: &str) -> Vec<&'f PathBuf> {
        let own: Vec<&PathBuf> = files.iter().filter(|p| is_subreddit_dump(p, subreddit)).collect();
        if own.is_empty() {
            files.iter().collect()
        } else {
            own
        }
    }
}

/// True when the file stem is `<subreddit>_submissions` or `<subreddit>_comments`,
/// optionally followed by `_<suffix>`.
fn is_subreddit_dump(path: &Path, subreddit: &str) -> bool {
    let Some(stem) = path.file_name().and_then(|n| n.to_str()).map(|n| n.to_lowercase()) else {
        return false;
    };
    let stem = stem.split('.').next().unwrap_or_default();
    let Some(rest) = stem.strip_prefix(subreddit).and_then(|r| r.strip_prefix('_')) else {
        return false;
    };
    ["submissions", "comments"].iter().any(|family| {
        rest.strip_prefix(family).is_some_and(|tail| tail.is_empty() || tail.starts_with('_'))
    })
}

/// `<output_dir>/user/<author>/index.html`
pub fn user_page_path(output_dir: &Path, author: &str) -> PathBuf {
    output_dir.join("user").join(author.to_lowercase()).join("index.html")
}

impl UnitWorker for ArchiveWorker<'_> {
    fn process_unit(
        &mut self,
        subreddit: &str,
        activity: &mut UserActivity,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<UnitReport> {
        let filter = CommunityFilter::new([subreddit]);
        let mut report = UnitReport::default();
        let families = [(RecordKind::Posts, &self.files.posts), (RecordKind::Comments, &self.files.comments)];
        for (kind, files) in families {
            for path in Self::files_for(files, subreddit) {
                let stats = ingest_file(
                    &self.loader,
                    path,
                    self.opts.platform,
                    kind,
                    &self.opts,
                    Some(&filter),
                    checkpoint,
                    Some(&mut *activity),
                )?;
                report.records += stats.records_processed;
                report.failed += stats.records_failed;
                report.skipped += stats.bad_lines;
                self.totals.merge(&stats);
                self.totals.database_size_mb = stats.database_size_mb;
            }
        }
        Ok(report)
    }

    fn rebuild_activity(&mut self, completed: &[String], activity: &mut UserActivity) -> Result<()> {
        for sub in completed {
            for (author, n) in self.loader.store().author_counts(sub)? {
                activity.record_many(sub, &author, n);
            }
        }
        Ok(())
    }

    fn generate_user_pages(&mut self, activity: &UserActivity, checkpoint: &mut dyn Checkpoint) -> Result<usize> {
        let Some(renderer) = self.renderer.as_mut() else {
            tracing::info!("no user page renderer configured; {} users tracked", activity.total_unique_users.len());
            return Ok(0);
        };
        let mut users: Vec<&String> = activity.total_unique_users.iter().collect();
        users.sort();
        let pb = ProgressScope::count("User pages", users.len() as u64, self.opts.progress);
        let mut written = 0usize;
        for (i, author) in users.into_iter().enumerate() {
            let dest = user_page_path(&self.opts.output_dir, author);
            if self.policy.should_regenerate(&dest) {
                renderer.render_user_page(author, activity, &dest)?;
                written += 1;
            }
            pb.inc(1);
            if (i + 1) % 1000 == 0 {
                checkpoint.checkpoint()?;
            }
        }
        pb.finish("User pages done");
        Ok(written)
    }
}
