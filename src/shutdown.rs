use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation flag observed at checkpoints (after each batch, after each unit).
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Route Ctrl-C / SIGTERM to `token`. A second interrupt exits immediately.
pub fn install_signal_handler(token: &ShutdownToken) -> Result<()> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        if token.is_requested() {
            eprintln!("\nSecond interrupt, exiting without saving progress");
            std::process::exit(130);
        }
        eprintln!("\nInterrupt received, finishing the current batch and saving progress...");
        token.request();
    })
    .context("Failed to set signal handler")
}
