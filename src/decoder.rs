//! Streaming line decoder over compressed archive files.
//!
//! Yields `(line, position)` pairs where `position` is the number of decompressed
//! bytes consumed through the end of that line. None of the supported codecs are
//! seekable, so resuming from a stored position (`open_at`) re-decodes and discards
//! the prefix. Memory use is bounded by the chunk size plus the longest line.

use crate::config::IngestOptions;
use crate::error::ArchiveError;
use crate::util::open_with_backoff;
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use zstd::stream::read::Decoder;

/// Compression format, picked from the file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Zstd,
    SevenZip,
    Plain,
}

impl Codec {
    pub fn for_path(path: &Path) -> Codec {
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
            Some("zst") | Some("zstd") => Codec::Zstd,
            Some("7z") => Codec::SevenZip,
            _ => Codec::Plain,
        }
    }
}

/// Decoder tuning; usually derived from `IngestOptions`.
#[derive(Clone, Debug)]
pub struct DecodeCfg {
    pub chunk_bytes: usize,
    pub read_buffer_bytes: usize,
    pub sevenzip_bin: String,
}

impl Default for DecodeCfg {
    fn default() -> Self {
        Self { chunk_bytes: 1 << 20, read_buffer_bytes: 256 * 1024, sevenzip_bin: "7z".to_string() }
    }
}

impl From<&IngestOptions> for DecodeCfg {
    fn from(o: &IngestOptions) -> Self {
        Self {
            chunk_bytes: o.chunk_bytes,
            read_buffer_bytes: o.read_buffer_bytes,
            sevenzip_bin: o.sevenzip_bin.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedLine {
    pub text: String,
    pub position: u64,
}

/// A `Read` wrapper that counts bytes read from the underlying file.
struct CountingReader<R: Read> {
    inner: R,
    counter: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

// ----------------------------- Helpers for full-error logging ------------------------------------

#[inline]
fn warn_decode_skip(path: &Path, position: u64, e: &io::Error) {
    let abs = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let msg = format!(
        "Stopping decode after error\n  path    : {}\n  position: {} decompressed bytes\n  error   : {}\n\
         note    : This usually indicates a truncated or corrupt archive. \
                   Lines decoded before the error were kept; the rest of the file is skipped.",
        abs.display(),
        position,
        e
    );
    eprintln!("{}", msg);
    tracing::warn!("{}", msg);
}

// ----------------------------- Decoder ------------------------------------

pub struct StreamDecoder {
    path: PathBuf,
    source: Box<dyn Read + Send>,
    child: Option<Child>,
    chunk: Vec<u8>,
    pending: Vec<u8>,
    ready: VecDeque<DecodedLine>,
    /// Decompressed bytes pulled from `source` so far (including skipped prefix).
    consumed: u64,
    compressed: Arc<AtomicU64>,
    finished: bool,
    decode_error: Option<String>,
}

impl StreamDecoder {
    pub fn open(path: &Path, cfg: &DecodeCfg) -> Result<Self> {
        if !path.is_file() {
            return Err(ArchiveError::not_found(path, "archive file").into());
        }
        let compressed = Arc::new(AtomicU64::new(0));
        let (source, child): (Box<dyn Read + Send>, Option<Child>) = match Codec::for_path(path) {
            Codec::Zstd => {
                let file = open_with_backoff(path, 16, 50).with_context(|| format!("open {}", path.display()))?;
                let counted = CountingReader { inner: file, counter: compressed.clone() };
                let mut dec = Decoder::with_buffer(BufReader::with_capacity(cfg.read_buffer_bytes, counted))?;
                dec.window_log_max(31)?;
                (Box::new(dec), None)
            }
            Codec::SevenZip => {
                let mut child = Command::new(&cfg.sevenzip_bin)
                    .arg("e")
                    .arg("-so")
                    .arg(path)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .spawn()
                    .with_context(|| format!("spawn '{}' for {}", cfg.sevenzip_bin, path.display()))?;
                let stdout = child.stdout.take().context("7z stdout not captured")?;
                (Box::new(stdout), Some(child))
            }
            Codec::Plain => {
                let file: File = open_with_backoff(path, 16, 50).with_context(|| format!("open {}", path.display()))?;
                let counted = CountingReader { inner: file, counter: compressed.clone() };
                (Box::new(BufReader::with_capacity(cfg.read_buffer_bytes, counted)), None)
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            source,
            child,
            chunk: vec![0u8; cfg.chunk_bytes.max(4096)],
            pending: Vec::new(),
            ready: VecDeque::new(),
            consumed: 0,
            compressed,
            finished: false,
            decode_error: None,
        })
    }

    /// Open and discard the first `offset` decompressed bytes. `offset` should be a
    /// `position` previously yielded for this file.
    pub fn open_at(path: &Path, offset: u64, cfg: &DecodeCfg) -> Result<Self> {
        let mut dec = Self::open(path, cfg)?;
        if offset > 0 {
            let skipped = io::copy(&mut (&mut dec.source).take(offset), &mut io::sink())
                .with_context(|| format!("skip to offset {} in {}", offset, path.display()))?;
            dec.consumed = skipped;
            if skipped < offset {
                tracing::warn!("{}: resume offset {} past end of stream ({} bytes)", path.display(), offset, skipped);
                dec.finished = true;
            }
        }
        Ok(dec)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Compressed bytes read from disk so far (0 for external-process codecs).
    pub fn compressed_bytes_read(&self) -> u64 {
        self.compressed.load(Ordering::Relaxed)
    }

    /// Decompressed bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.consumed
    }

    /// Set when decoding stopped on a corrupt or truncated stream.
    pub fn decode_error(&self) -> Option<&str> {
        self.decode_error.as_deref()
    }

    fn push_line(&mut self, mut bytes: Vec<u8>, position: u64) {
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        let text = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        self.ready.push_back(DecodedLine { text, position });
    }

    /// Decode one chunk. Returns false once the stream is exhausted.
    fn fill(&mut self) -> bool {
        let n = loop {
            match self.source.read(&mut self.chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn_decode_skip(&self.path, self.consumed, &e);
                    self.decode_error = Some(e.to_string());
                    // a partial line before a decode error is not trustworthy
                    self.pending.clear();
                    return false;
                }
            }
        };

        if n == 0 {
            if !self.pending.is_empty() {
                let tail = std::mem::take(&mut self.pending);
                let pos = self.consumed;
                self.push_line(tail, pos);
            }
            self.reap_child();
            return false;
        }

        let base = self.consumed;
        let mut start = 0usize;
        let mut i = 0usize;
        while i < n {
            if self.chunk[i] == b'\n' {
                let mut line = std::mem::take(&mut self.pending);
                line.extend_from_slice(&self.chunk[start..i]);
                self.push_line(line, base + i as u64 + 1);
                start = i + 1;
            }
            i += 1;
        }
        self.pending.extend_from_slice(&self.chunk[start..n]);
        self.consumed += n as u64;
        true
    }

    fn reap_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) if !status.success() => {
                    tracing::warn!("{}: extractor exited with {}", self.path.display(), status);
                    self.decode_error = Some(format!("extractor exited with {status}"));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("{}: waiting for extractor failed: {}", self.path.display(), e),
            }
        }
    }
}

impl Iterator for StreamDecoder {
    type Item = DecodedLine;

    fn next(&mut self) -> Option<DecodedLine> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Some(line);
            }
            if self.finished {
                return None;
            }
            if !self.fill() {
                self.finished = true;
            }
        }
    }
}

impl Drop for StreamDecoder {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
