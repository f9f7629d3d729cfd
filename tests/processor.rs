#[path = "common/mod.rs"]
mod common;

use anyhow::{anyhow, Result};
use common::*;
use redarc::{
    Checkpoint, Halt, IncrementalProcessor, MemoryLevel, MemoryThresholds, NoCheckpoint, Phase, ProgressState,
    ResumeStrategy, RunOutcome,
    ShutdownToken, UnitReport, UnitWorker, UserActivity, PROGRESS_FILE_NAME,
};
use serde_json::json;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn subs(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Worker with scripted behavior per unit.
#[derive(Default)]
struct ScriptedWorker {
    seen: Vec<String>,
    fail: Vec<&'static str>,
    /// Request shutdown once this unit finishes.
    stop_after: Option<&'static str>,
    /// Request shutdown and hit a checkpoint in the middle of this unit.
    stop_inside: Option<&'static str>,
    /// Raise sampled memory while processing this unit.
    spike_in: Option<(&'static str, FakeSampler, u64)>,
    token: Option<ShutdownToken>,
    pages_called: usize,
    users_seen: usize,
    rebuilt: Vec<String>,
}

impl UnitWorker for ScriptedWorker {
    fn process_unit(
        &mut self,
        subreddit: &str,
        activity: &mut UserActivity,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<UnitReport> {
        self.seen.push(subreddit.to_string());
        if self.fail.iter().any(|f| *f == subreddit) {
            return Err(anyhow!("corrupt archive for {subreddit}"));
        }
        if self.stop_inside == Some(subreddit) {
            if let Some(t) = &self.token {
                t.request();
            }
            checkpoint.checkpoint()?;
        }
        if let Some((sub, sampler, bytes)) = &self.spike_in {
            if *sub == subreddit {
                sampler.set(*bytes);
            }
        }
        activity.record(subreddit, &format!("{subreddit}_author"));
        activity.record(subreddit, "[deleted]");
        if self.stop_after == Some(subreddit) {
            if let Some(t) = &self.token {
                t.request();
            }
        }
        Ok(UnitReport { records: 10, failed: 1, skipped: 2 })
    }

    fn rebuild_activity(&mut self, completed: &[String], activity: &mut UserActivity) -> Result<()> {
        self.rebuilt = completed.to_vec();
        for sub in completed {
            activity.record(sub, &format!("{sub}_author"));
        }
        Ok(())
    }

    fn generate_user_pages(&mut self, activity: &UserActivity, _checkpoint: &mut dyn Checkpoint) -> Result<usize> {
        self.pages_called += 1;
        self.users_seen = activity.total_unique_users.len();
        Ok(self.users_seen)
    }
}

fn write_state(dir: &std::path::Path, value: serde_json::Value) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(PROGRESS_FILE_NAME), value.to_string()).unwrap();
}

/// No progress file means a fresh start with nothing carried over.
#[test]
fn detect_without_progress_file_starts_fresh() {
    let tmp = tempfile::tempdir().unwrap();
    let p = IncrementalProcessor::new(output_dir(&tmp), 0.0).unwrap();
    let (strategy, saved) = p.detect_processing_state().unwrap();
    assert_eq!(strategy, ResumeStrategy::StartFresh);
    assert!(saved.is_none());
    assert_eq!(p.progress_file(), output_dir(&tmp).join(".archive-progress.json"));
}

/// Every persisted phase maps to its resume strategy; minimal files are accepted.
#[test]
fn detect_maps_each_phase() {
    let cases = [
        (json!({"phase": "complete", "timestamp": "2024-01-01T00:00:00Z"}), ResumeStrategy::AlreadyComplete),
        (
            json!({"phase": "interrupted", "completed_subreddits": ["a"], "remaining_subreddits": ["b"]}),
            ResumeStrategy::ResumeSubreddits,
        ),
        (json!({"phase": "subreddit_processing"}), ResumeStrategy::ResumeSubreddits),
        (
            json!({"phase": "emergency_oom_shutdown", "is_emergency": true, "memory_usage_at_failure": "7.5GB"}),
            ResumeStrategy::ResumeFromEmergency,
        ),
        (json!({"phase": "user_page_generation"}), ResumeStrategy::ResumeUsers),
        (json!({"phase": "something_new"}), ResumeStrategy::ResumeSubreddits),
    ];
    for (state, expected) in cases {
        let tmp = tempfile::tempdir().unwrap();
        write_state(&output_dir(&tmp), state.clone());
        let p = IncrementalProcessor::new(output_dir(&tmp), 0.0).unwrap();
        let (strategy, saved) = p.detect_processing_state().unwrap();
        assert_eq!(strategy, expected, "state {state}");
        assert!(saved.is_some());
    }
}

/// Saved lists come back verbatim with the resume decision.
#[test]
fn detect_carries_saved_lists() {
    let tmp = tempfile::tempdir().unwrap();
    write_state(
        &output_dir(&tmp),
        json!({"phase": "interrupted", "completed_subreddits": ["a", "b"], "remaining_subreddits": ["c"],
               "failed_subreddits": ["x"], "current_subreddit": null}),
    );
    let p = IncrementalProcessor::new(output_dir(&tmp), 0.0).unwrap();
    let (_, saved) = p.detect_processing_state().unwrap();
    let saved = saved.unwrap();
    assert_eq!(saved.phase, Phase::Interrupted);
    assert_eq!(saved.completed_subreddits, subs(&["a", "b"]));
    assert_eq!(saved.remaining_subreddits, subs(&["c"]));
    assert_eq!(saved.failed_subreddits, subs(&["x"]));
}

/// An unreadable progress file is ignored rather than aborting the run.
#[test]
fn detect_treats_corrupt_file_as_fresh() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir_all(output_dir(&tmp)).unwrap();
    fs::write(output_dir(&tmp).join(PROGRESS_FILE_NAME), "{ truncated").unwrap();
    let p = IncrementalProcessor::new(output_dir(&tmp), 0.0).unwrap();
    assert_eq!(p.detect_processing_state().unwrap().0, ResumeStrategy::StartFresh);
}

/// A trailing separator on the output directory is tolerated.
#[test]
fn output_dir_trailing_slash_is_stripped() {
    let tmp = tempfile::tempdir().unwrap();
    let with_slash = format!("{}/", output_dir(&tmp).display());
    let p = IncrementalProcessor::new(&with_slash, 0.0).unwrap();
    assert_eq!(p.output_dir(), output_dir(&tmp));
    assert!(p.output_dir().is_absolute());
    assert!(p.output_dir().is_dir());
}

/// Saving writes valid JSON with the lists, phase and an RFC 3339 timestamp;
/// emergency-only fields stay absent on normal saves.
#[test]
fn save_progress_state_round_trips() {
    let tmp = tempfile::tempdir().unwrap();
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 0.0).unwrap();
    p.completed_subreddits = subs(&["a"]);
    p.remaining_subreddits = subs(&["b", "c"]);
    p.current_subreddit = Some("b".into());
    p.total_subreddits = 3;
    p.save_progress_state(Phase::SubredditProcessing, false).unwrap();

    let raw = read_json(p.progress_file());
    assert_eq!(raw["phase"], "subreddit_processing");
    assert_eq!(raw["current_subreddit"], "b");
    assert!(raw.get("is_emergency").is_none());
    assert!(raw.get("memory_usage_at_failure").is_none());
    assert!(raw["timestamp"].as_str().unwrap().contains('T'));

    let state: ProgressState = serde_json::from_value(raw).unwrap();
    assert_eq!(state.remaining_subreddits, subs(&["b", "c"]));
    assert_eq!(state.total_subreddits, 3);
    assert!(!p.progress_file().with_file_name(".archive-progress.json.tmp").exists());
}

/// Monitoring disabled (ceiling 0) always reports 0.
#[test]
fn memory_check_disabled_reports_zero() {
    let tmp = tempfile::tempdir().unwrap();
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 0.0)
        .unwrap()
        .with_sampler(Box::new(FakeSampler::new(100 * GB)));
    assert!(!p.memory_monitoring_enabled());
    assert_eq!(p.max_memory_bytes(), None);
    assert_eq!(p.check_memory_usage(), 0.0);
}

/// The fraction is measured against the ceiling and clamped to 1.
#[test]
fn memory_check_fraction_and_clamp() {
    let tmp = tempfile::tempdir().unwrap();
    let sampler = FakeSampler::new(5 * GB);
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 10.0)
        .unwrap()
        .with_sampler(Box::new(sampler.clone()));
    assert!((p.check_memory_usage() - 0.5).abs() < 1e-9);
    sampler.set(40 * GB);
    assert_eq!(p.check_memory_usage(), 1.0);
}

/// Below the info threshold nothing is reclaimed; critical forces a pass.
#[test]
fn reclaim_only_from_critical_upwards() {
    let tmp = tempfile::tempdir().unwrap();
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 10.0).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    p.add_reclaim_hook(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });

    for f in [0.0, 0.2, 0.45, 0.5999] {
        assert_eq!(p.handle_memory_fraction(f).unwrap(), MemoryLevel::Normal);
    }
    assert_eq!(p.handle_memory_fraction(0.65).unwrap(), MemoryLevel::Info);
    assert_eq!(p.handle_memory_fraction(0.75).unwrap(), MemoryLevel::Warning);
    assert_eq!(p.collections_forced(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert_eq!(p.handle_memory_fraction(0.90).unwrap(), MemoryLevel::Critical);
    assert_eq!(p.collections_forced(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!p.progress_file().exists(), "no state is written below emergency");
}

/// At 95% or more the emergency state is persisted with memory figures.
#[test]
fn emergency_threshold_persists_state() {
    let tmp = tempfile::tempdir().unwrap();
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 10.0)
        .unwrap()
        .with_sampler(Box::new(FakeSampler::new(GB * 96 / 10)));
    p.remaining_subreddits = subs(&["a", "b"]);

    assert_eq!(p.monitor_memory().unwrap(), MemoryLevel::Emergency);
    assert_eq!(p.phase(), &Phase::EmergencyOomShutdown);

    let raw = read_json(p.progress_file());
    assert_eq!(raw["phase"], "emergency_oom_shutdown");
    assert_eq!(raw["is_emergency"], true);
    assert_eq!(raw["memory_usage_at_failure"], "9.60GB");
    assert_eq!(raw["memory_limit"], "10.00GB");
    assert_eq!(raw["remaining_subreddits"], json!(["a", "b"]));
}

/// A tighter ladder moves every level down; `NoCheckpoint` never halts.
#[test]
fn custom_thresholds() {
    let t = MemoryThresholds { info: 0.1, warning: 0.2, critical: 0.3, emergency: 0.4 };
    assert_eq!(MemoryThresholds::default().level(0.5), MemoryLevel::Normal);
    assert_eq!(t.level(0.5), MemoryLevel::Emergency);
    assert_eq!(t.level(0.25), MemoryLevel::Warning);

    let tmp = tempfile::tempdir().unwrap();
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 1.0).unwrap().with_thresholds(t);
    assert_eq!(p.thresholds(), t);
    assert_eq!(p.handle_memory_fraction(0.35).unwrap(), MemoryLevel::Critical);
    assert_eq!(p.collections_forced(), 1);
    assert!(NoCheckpoint.checkpoint().is_ok());
}

/// Proactive cleanup runs the hooks and reports the fraction afterwards.
#[test]
fn proactive_cleanup_returns_fraction() {
    let tmp = tempfile::tempdir().unwrap();
    let sampler = FakeSampler::new(2 * GB);
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 4.0)
        .unwrap()
        .with_sampler(Box::new(sampler.clone()));
    let s = sampler.clone();
    p.add_reclaim_hook(move || s.set(GB));
    let after = p.trigger_proactive_cleanup();
    assert!((after - 0.25).abs() < 1e-9);
    assert_eq!(p.collections_forced(), 1);
}

/// A clean run processes every unit in order and ends in `complete`.
#[test]
fn run_completes_all_units() {
    let tmp = tempfile::tempdir().unwrap();
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 0.0).unwrap();
    let mut w = ScriptedWorker::default();
    let summary = p.run(&subs(&["a", "r/B", "c", "a"]), &mut w).unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(summary.is_success());
    assert_eq!(w.seen, subs(&["a", "b", "c"]));
    assert_eq!(summary.completed, subs(&["a", "b", "c"]));
    assert_eq!(summary.records_processed, 30);
    assert_eq!(summary.records_failed, 3);
    assert_eq!(summary.records_skipped, 6);
    assert_eq!(w.pages_called, 1);
    assert_eq!(w.users_seen, 3, "[deleted] is not tracked");
    assert!(p.user_activity.user_pages_generated);
    assert_eq!(read_json(p.progress_file())["phase"], "complete");
    assert!(summary.to_string().contains("3 completed"));
}

/// A failing unit is recorded and the run moves on.
#[test]
fn run_records_unit_failure_and_continues() {
    let tmp = tempfile::tempdir().unwrap();
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 0.0).unwrap();
    let mut w = ScriptedWorker { fail: vec!["b"], ..Default::default() };
    let summary = p.run(&subs(&["a", "b", "c"]), &mut w).unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(!summary.is_success());
    assert_eq!(summary.completed, subs(&["a", "c"]));
    assert_eq!(summary.failed, subs(&["b"]));
    let raw = read_json(p.progress_file());
    assert_eq!(raw["failed_subreddits"], json!(["b"]));
    assert!(summary.to_string().contains("failed     : b"));
}

/// Interrupting between units saves `interrupted`; the next run resumes with
/// only the remaining units.
#[test]
fn interrupted_run_resumes_from_remaining() {
    let tmp = tempfile::tempdir().unwrap();
    let token = ShutdownToken::new();
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 0.0)
        .unwrap()
        .with_shutdown_token(token.clone());
    let mut w = ScriptedWorker { stop_after: Some("a"), token: Some(token), ..Default::default() };
    let summary = p.run(&subs(&["a", "b", "c"]), &mut w).unwrap();

    assert_eq!(summary.outcome, RunOutcome::Halted(Halt::Interrupted));
    assert_eq!(summary.completed, subs(&["a"]));
    assert_eq!(summary.remaining, subs(&["b", "c"]));
    assert_eq!(w.pages_called, 0);
    let raw = read_json(p.progress_file());
    assert_eq!(raw["phase"], "interrupted");
    assert_eq!(raw["remaining_subreddits"], json!(["b", "c"]));

    let mut p2 = IncrementalProcessor::new(output_dir(&tmp), 0.0).unwrap();
    let mut w2 = ScriptedWorker::default();
    let summary = p2.run(&subs(&["a", "b", "c"]), &mut w2).unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(w2.seen, subs(&["b", "c"]));
    assert_eq!(summary.completed, subs(&["a", "b", "c"]));
    // "a" finished in the first run; its users come back through the rebuild
    assert_eq!(w2.rebuilt, subs(&["a"]));
    assert_eq!(w2.users_seen, 3);
}

/// A halt raised inside a unit leaves that unit queued for the next run.
#[test]
fn halt_inside_unit_keeps_it_remaining() {
    let tmp = tempfile::tempdir().unwrap();
    let token = ShutdownToken::new();
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 0.0)
        .unwrap()
        .with_shutdown_token(token.clone());
    let mut w = ScriptedWorker { stop_inside: Some("b"), token: Some(token), ..Default::default() };
    let summary = p.run(&subs(&["a", "b", "c"]), &mut w).unwrap();

    assert_eq!(summary.outcome, RunOutcome::Halted(Halt::Interrupted));
    assert_eq!(summary.completed, subs(&["a"]));
    assert_eq!(summary.remaining, subs(&["b", "c"]));
    assert!(summary.failed.is_empty());
}

/// Crossing the emergency threshold mid-run halts and the next run resumes
/// through the emergency path.
#[test]
fn emergency_halts_and_resumes() {
    let tmp = tempfile::tempdir().unwrap();
    let sampler = FakeSampler::new(GB);
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 10.0)
        .unwrap()
        .with_sampler(Box::new(sampler.clone()));
    let mut w = ScriptedWorker { spike_in: Some(("b", sampler.clone(), 10 * GB)), ..Default::default() };
    let summary = p.run(&subs(&["a", "b", "c"]), &mut w).unwrap();

    assert!(matches!(summary.outcome, RunOutcome::Halted(Halt::MemoryEmergency { .. })));
    assert_eq!(summary.completed, subs(&["a", "b"]));
    assert_eq!(summary.remaining, subs(&["c"]));
    let raw = read_json(p.progress_file());
    assert_eq!(raw["phase"], "emergency_oom_shutdown");
    assert_eq!(raw["is_emergency"], true);

    sampler.set(GB);
    let mut p2 = IncrementalProcessor::new(output_dir(&tmp), 10.0)
        .unwrap()
        .with_sampler(Box::new(sampler.clone()));
    assert_eq!(p2.detect_processing_state().unwrap().0, ResumeStrategy::ResumeFromEmergency);
    let mut w2 = ScriptedWorker::default();
    let summary = p2.run(&subs(&["a", "b", "c"]), &mut w2).unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(w2.seen, subs(&["c"]));
    assert_eq!(w2.users_seen, 3);
    assert!(p2.collections_forced() >= 1);
}

/// A finished run is not repeated.
#[test]
fn completed_run_is_not_repeated() {
    let tmp = tempfile::tempdir().unwrap();
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 0.0).unwrap();
    p.run(&subs(&["a"]), &mut ScriptedWorker::default()).unwrap();

    let mut p2 = IncrementalProcessor::new(output_dir(&tmp), 0.0).unwrap();
    let mut w = ScriptedWorker::default();
    let summary = p2.run(&subs(&["a", "b"]), &mut w).unwrap();
    assert_eq!(summary.outcome, RunOutcome::AlreadyComplete);
    assert!(w.seen.is_empty());
    assert!(summary.is_success());
}

/// Subreddits requested on resume but unknown to the saved run are appended.
#[test]
fn resume_appends_new_subreddits() {
    let tmp = tempfile::tempdir().unwrap();
    write_state(
        &output_dir(&tmp),
        json!({"phase": "interrupted", "completed_subreddits": ["a"], "remaining_subreddits": ["b"],
               "total_subreddits": 2}),
    );
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 0.0).unwrap();
    let mut w = ScriptedWorker::default();
    let summary = p.run(&subs(&["a", "b", "d"]), &mut w).unwrap();
    assert_eq!(w.seen, subs(&["b", "d"]));
    assert_eq!(summary.completed, subs(&["a", "b", "d"]));
    assert_eq!(p.total_subreddits, 3);
}

/// Resuming in the user-page phase skips subreddit processing.
#[test]
fn resume_users_skips_units() {
    let tmp = tempfile::tempdir().unwrap();
    write_state(
        &output_dir(&tmp),
        json!({"phase": "user_page_generation", "completed_subreddits": ["a", "b"], "remaining_subreddits": []}),
    );
    let mut p = IncrementalProcessor::new(output_dir(&tmp), 0.0).unwrap();
    let mut w = ScriptedWorker::default();
    let summary = p.run(&subs(&["a", "b"]), &mut w).unwrap();
    assert!(w.seen.is_empty());
    assert_eq!(w.pages_called, 1);
    assert_eq!(w.rebuilt, subs(&["a", "b"]));
    assert_eq!(w.users_seen, 2);
    assert_eq!(summary.outcome, RunOutcome::Completed);
}

/// High-activity users are those at or above the threshold.
#[test]
fn user_activity_tracks_high_activity() {
    let mut a = UserActivity::new(3);
    for _ in 0..3 {
        a.record("Rust", "alice");
    }
    a.record("golang", "bob");
    a.record("golang", "[removed]");
    assert_eq!(a.total_unique_users.len(), 2);
    assert!(a.high_activity_users.contains("alice"));
    assert!(!a.high_activity_users.contains("bob"));
    assert_eq!(a.records_by("alice"), 3);
    assert!(a.users_by_subreddit.get("rust").unwrap().contains("alice"));
}

/// `request_shutdown` flips the token the processor checks.
#[test]
fn request_shutdown_sets_flag() {
    let tmp = tempfile::tempdir().unwrap();
    let p = IncrementalProcessor::new(output_dir(&tmp), 0.0).unwrap();
    assert!(!p.shutdown_requested());
    p.request_shutdown();
    assert!(p.shutdown_requested());
    assert!(p.shutdown_token().is_requested());
}
