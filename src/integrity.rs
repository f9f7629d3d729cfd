use crate::decoder::Codec;
use crate::importer::DetectedFiles;
use crate::progress::ProgressScope;
use crate::util::open_with_backoff;
use anyhow::Result;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use zstd::stream::read::Decoder;

/// Mode for integrity checks.
#[derive(Clone, Copy, Debug)]
pub enum IntegrityMode {
    /// Decode only the first `sample_bytes` (decompressed) per file.
    /// Fast and catches early corruption; cannot detect trailing corruption.
    Quick { sample_bytes: u64 },
    /// Decode the entire stream, validating checksums.
    Full,
}

/// Decode at most `max_decompressed_bytes` of a zstd file, discarding the output.
pub fn quick_validate_zst(path: &Path, max_decompressed_bytes: u64) -> Result<()> {
    let file = open_with_backoff(path, 16, 50)?;
    let mut decoder = Decoder::new(file)?;
    decoder.window_log_max(31)?;
    let mut limited = decoder.take(max_decompressed_bytes);
    io::copy(&mut limited, &mut io::sink())?;
    Ok(())
}

/// Decode the entire stream to EOF.
pub fn validate_zst_full(path: &Path) -> Result<()> {
    let file = open_with_backoff(path, 16, 50)?;
    let mut decoder = Decoder::new(file)?;
    decoder.window_log_max(31)?;
    io::copy(&mut decoder, &mut io::sink())?;
    Ok(())
}

fn check_one(path: &Path, mode: IntegrityMode) -> Result<()> {
    match Codec::for_path(path) {
        Codec::Zstd => match mode {
            IntegrityMode::Quick { sample_bytes } => quick_validate_zst(path, sample_bytes),
            IntegrityMode::Full => validate_zst_full(path),
        },
        // 7z archives are verified by the external tool when they are decoded
        Codec::SevenZip => Ok(()),
        Codec::Plain => {
            open_with_backoff(path, 16, 50)?;
            Ok(())
        }
    }
}

/// Check every detected archive file before a long ingestion run. Returns
/// `(path, error_message)` for each file that failed.
///
/// At most `file_concurrency` files are decoded at once.
pub fn check_archive_integrity(
    files: &DetectedFiles,
    mode: IntegrityMode,
    file_concurrency: usize,
    progress: bool,
) -> Result<Vec<(PathBuf, String)>> {
    let all: Vec<&PathBuf> = files.all().collect();
    let label = match mode {
        IntegrityMode::Quick { .. } => "Integrity (quick)",
        IntegrityMode::Full => "Integrity (full)",
    };
    let pb = ProgressScope::count(label, all.len() as u64, progress);
    let errors = Mutex::new(Vec::<(PathBuf, String)>::new());

    for chunk in all.chunks(file_concurrency.max(1)) {
        chunk.par_iter().for_each(|path| {
            if let Err(e) = check_one(path, mode) {
                tracing::warn!("integrity check failed for {}: {:#}", path.display(), e);
                errors.lock().push(((*path).clone(), format!("{e:#}")));
            }
            pb.inc(1);
        });
    }

    pb.finish("done");
    let mut errors = errors.into_inner();
    errors.sort();
    Ok(errors)
}
