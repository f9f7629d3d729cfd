use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessExt, System, SystemExt};

/// Source of the current process's resident memory, in bytes.
pub trait MemorySampler: Send {
    fn resident_bytes(&mut self) -> Result<u64>;
}

/// `sysinfo`-backed sampler for this process.
/// Refreshes at most every `REFRESH_EVERY`; in between it returns the cached value.
pub struct ProcessMemory {
    sys: System,
    pid: Pid,
    last_check: Option<Instant>,
    last_rss: u64,
}

const REFRESH_EVERY: Duration = Duration::from_millis(250);

impl ProcessMemory {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("cannot resolve current pid: {e}"))?;
        Ok(Self { sys: System::new(), pid, last_check: None, last_rss: 0 })
    }
}

impl MemorySampler for ProcessMemory {
    fn resident_bytes(&mut self) -> Result<u64> {
        let now = Instant::now();
        let stale = self.last_check.map_or(true, |t| now.duration_since(t) >= REFRESH_EVERY);
        if stale {
            if !self.sys.refresh_process(self.pid) {
                return Err(anyhow!("process {} not visible to sysinfo", self.pid));
            }
            let proc_ = self.sys.process(self.pid).ok_or_else(|| anyhow!("process {} vanished", self.pid))?;
            self.last_rss = proc_.memory();
            self.last_check = Some(now);
        }
        Ok(self.last_rss)
    }
}

/// Fraction of system RAM currently available (0.0..1.0). Used only for logging context.
pub fn available_memory_fraction() -> f64 {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory() as f64;
    if total > 0.0 { (sys.available_memory() as f64 / total).clamp(0.0, 1.0) } else { 1.0 }
}

/// Pressure levels against the configured ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryLevel {
    Normal,
    Info,
    Warning,
    Critical,
    Emergency,
}

/// Threshold ladder, as fractions of the ceiling.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MemoryThresholds {
    pub info: f64,
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self { info: 0.60, warning: 0.70, critical: 0.85, emergency: 0.95 }
    }
}

impl MemoryThresholds {
    pub fn level(&self, fraction: f64) -> MemoryLevel {
        if fraction >= self.emergency {
            MemoryLevel::Emergency
        } else if fraction >= self.critical {
            MemoryLevel::Critical
        } else if fraction >= self.warning {
            MemoryLevel::Warning
        } else if fraction >= self.info {
            MemoryLevel::Info
        } else {
            MemoryLevel::Normal
        }
    }
}

/// Converts a ceiling in GB to bytes; 0 (or negative) means unbounded.
pub fn ceiling_bytes(max_memory_gb: f64) -> Option<u64> {
    if max_memory_gb > 0.0 {
        Some((max_memory_gb * 1024.0 * 1024.0 * 1024.0) as u64)
    } else {
        None
    }
}
