#[path = "common/mod.rs"]
mod common;

use common::*;
use redarc::{check_archive_integrity, quick_validate_zst, validate_zst_full, DetectedFiles, IntegrityMode, Platform};
use std::fs;

fn lines(n: usize) -> Vec<String> {
    (0..n).map(|i| format!(r#"{{"id":"{i}","body":"row {} {}"}}"#, i * 31 % 977, i * i % 4099)).collect()
}

/// A clean dump passes both modes.
#[test]
fn clean_dump_passes() {
    let dump = make_reddit_dump();
    let files = Platform::Reddit.detect_files(dump.path()).unwrap();
    for mode in [IntegrityMode::Quick { sample_bytes: 1 << 20 }, IntegrityMode::Full] {
        assert!(check_archive_integrity(&files, mode, 2, false).unwrap().is_empty());
    }
}

/// Garbage with a .zst extension is caught even by the quick check.
#[test]
fn garbage_is_detected_in_both_modes() {
    let dump = make_reddit_dump();
    let bad = dump.path().join("RS_2006-02_submissions.zst");
    fs::write(&bad, b"this is not a zstd frame at all").unwrap();
    let files = Platform::Reddit.detect_files(dump.path()).unwrap();

    for mode in [IntegrityMode::Quick { sample_bytes: 1 << 20 }, IntegrityMode::Full] {
        let errors = check_archive_integrity(&files, mode, 1, false).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, bad);
        assert!(!errors[0].1.is_empty());
    }
}

/// Truncation past the sampled prefix only shows up in a full check.
#[test]
fn truncation_needs_full_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("RC_truncated_comments.zst");
    write_zst_lines(&path, &lines(50_000));
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 64]).unwrap();

    assert!(quick_validate_zst(&path, 4096).is_ok());
    assert!(validate_zst_full(&path).is_err());

    let files = DetectedFiles { posts: vec![], comments: vec![path.clone()] };
    let errors = check_archive_integrity(&files, IntegrityMode::Full, 4, false).unwrap();
    assert_eq!(errors.iter().map(|(p, _)| p.clone()).collect::<Vec<_>>(), vec![path]);
}

/// Plain files only need to open; 7z archives are left to the extractor.
#[test]
fn plain_and_sevenzip_files() {
    let dir = tempfile::tempdir().unwrap();
    let plain = dir.path().join("RS_plain_submissions.ndjson");
    fs::write(&plain, "{}\n").unwrap();
    let sevenz = dir.path().join("submissions.7z");
    fs::write(&sevenz, "not really 7z").unwrap();
    let missing = dir.path().join("RC_gone_comments.ndjson");

    let files = DetectedFiles { posts: vec![plain, sevenz], comments: vec![missing.clone()] };
    let errors = check_archive_integrity(&files, IntegrityMode::Full, 2, false).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, missing);
}
