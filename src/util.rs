use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

static INIT_ONCE: std::sync::Once = std::sync::Once::new();
pub fn init_tracing_once() {
    INIT_ONCE.call_once(|| {
        let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
    });
}

// -------- robust file ops with backoff --------

/// Transient errors seen on network volumes and under AV/backup filter drivers
/// (sharing/lock violations, device-not-ready). Everything else fails fast.
fn is_retriable_io_error(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(5) | Some(21) | Some(32) | Some(33) | Some(225) | Some(433) | Some(1006) | Some(1117) | Some(1224)
    ) || e.kind() == io::ErrorKind::Interrupted
}

/// Run `op` up to `tries` times, sleeping `delay_ms * attempt` between retriable failures.
fn with_backoff<T>(tries: usize, delay_ms: u64, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let tries = tries.max(1);
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < tries && is_retriable_io_error(&e) => {
                sleep(Duration::from_millis(delay_ms.saturating_mul(attempt as u64)));
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn open_with_backoff(path: &Path, tries: usize, delay_ms: u64) -> io::Result<File> {
    with_backoff(tries, delay_ms, || File::open(path))
}

pub fn create_with_backoff(path: &Path, tries: usize, delay_ms: u64) -> io::Result<File> {
    with_backoff(tries, delay_ms, || File::create(path))
}

/// Atomically replace `dest` with `tmp`. Rename is atomic on the same volume;
/// when it keeps failing (sharing violations) fall back to copy + remove.
pub fn replace_file_atomic_backoff(tmp: &Path, dest: &Path) -> Result<()> {
    match with_backoff(20, 50, || fs::rename(tmp, dest)) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tracing::warn!("rename {} -> {} failed ({}), copying instead", tmp.display(), dest.display(), rename_err);
            with_backoff(20, 50, || fs::copy(tmp, dest))
                .with_context(|| format!("copy {} -> {}", tmp.display(), dest.display()))?;
            match with_backoff(20, 50, || fs::remove_file(tmp)) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("remove {}", tmp.display())),
            }
        }
    }
}

/// Serialize `value` as pretty JSON next to `dest`, fsync, then swap it into place.
/// Readers never observe a partially written file.
pub fn write_json_atomic<T: Serialize>(dest: &Path, value: &T) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let file_name = dest.file_name().and_then(|n| n.to_str()).unwrap_or("state.json");
    let tmp = dest.with_file_name(format!("{file_name}.tmp"));
    {
        let f = create_with_backoff(&tmp, 16, 50).with_context(|| format!("create {}", tmp.display()))?;
        let mut w = BufWriter::new(f);
        serde_json::to_writer_pretty(&mut w, value)?;
        w.write_all(b"\n")?;
        let f = w.into_inner().map_err(|e| e.into_error())?;
        f.sync_all()?;
    }
    replace_file_atomic_backoff(&tmp, dest)
}

/// Split a free-form list (commas, semicolons or whitespace) into trimmed, non-empty items.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Format a byte count as gigabytes with two decimals (e.g. "7.50GB").
pub fn format_gb(bytes: u64) -> String {
    format!("{:.2}GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

/// Lower-case and strip an optional `r/` or `/r/` prefix.
#[inline]
pub fn normalize_community(s: &str) -> String {
    let s = s.trim().to_lowercase();
    let s = s.strip_prefix('/').unwrap_or(&s);
    s.strip_prefix("r/").unwrap_or(s).to_string()
}
