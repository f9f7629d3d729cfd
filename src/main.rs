use anyhow::{bail, Result};
use redarc::{
    check_archive_integrity, init_tracing_once, install_signal_handler, load_subreddits_from_file, search_archive,
    set_global_multiprogress, ArchiveWorker, BulkLoader, IncrementalProcessor, IngestOptions, InputValidator,
    IntegrityMode, IntParam, RunOutcome, SafeRegex, SearchError, SearchParams, ShutdownToken, Store,
};
use indicatif::MultiProgress;
use std::process::ExitCode;
use std::sync::Arc;

// Everything is configured through ARCHIVE_* environment variables.
//
//   redarc                      ingest (resumes from <output>/.archive-progress.json)
//   redarc search <query...>    query the archive, print JSON results

fn main() -> ExitCode {
    init_tracing_once();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let res = match args.first().map(String::as_str) {
        Some("search") => search(&args[1..].join(" ")),
        None | Some("ingest") => ingest(),
        Some(other) => Err(anyhow::anyhow!("unknown command '{other}' (expected 'ingest' or 'search')")),
    };
    match res {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn ingest() -> Result<ExitCode> {
    let opts = IngestOptions::default().from_env()?;
    if opts.progress {
        // file bars render under the subreddit bar
        set_global_multiprogress(Arc::new(MultiProgress::new()));
    }
    let files = opts.platform.detect_files(&opts.input_dir)?;
    if opts.verify_archives {
        let bad = check_archive_integrity(&files, IntegrityMode::Quick { sample_bytes: 8 << 20 }, 4, opts.progress)?;
        if !bad.is_empty() {
            for (path, err) in &bad {
                eprintln!("corrupt: {} ({})", path.display(), err);
            }
            bail!("{} archive file(s) failed the integrity check", bad.len());
        }
    }

    let mut subreddits = opts.subreddits.clone().unwrap_or_default();
    if let Some(path) = &opts.subreddits_file {
        subreddits.extend(load_subreddits_from_file(path)?);
    }
    if subreddits.is_empty() {
        bail!("no subreddits to process: set ARCHIVE_SUBREDDITS or ARCHIVE_SUBREDDITS_FILE");
    }

    let store = Arc::new(Store::open(&opts.db_path, opts.pool_size)?);
    store.ensure_schema()?;

    let token = ShutdownToken::new();
    install_signal_handler(&token)?;

    let mut processor = IncrementalProcessor::new(&opts.output_dir, opts.max_memory_gb)?
        .with_shutdown_token(token)
        .with_high_activity_threshold(opts.high_activity_threshold)
        .with_progress(opts.progress);
    let hook_store = Arc::clone(&store);
    processor.add_reclaim_hook(move || {
        hook_store.release_memory();
    });

    let loader = BulkLoader::new(&store);
    loader.drop_indexes_for_bulk_load()?;
    let mut worker = ArchiveWorker::new(BulkLoader::new(&store), files, opts.clone());
    let summary = processor.run(&subreddits, &mut worker)?;

    let stats = worker.totals();
    println!("{summary}");
    println!(
        "  lines      : {} read, {} filtered, {} bad, {} duplicate",
        stats.total_lines, stats.records_filtered, stats.bad_lines, stats.duplicates
    );

    match &summary.outcome {
        RunOutcome::Completed | RunOutcome::AlreadyComplete => {
            loader.create_indexes_after_bulk_load()?;
            loader.analyze_tables()?;
            let info = store.database_info()?;
            println!(
                "  database   : {} posts, {} comments, {:.1} MB",
                info.post_count, info.comment_count, info.db_size_mb
            );
        }
        RunOutcome::Halted(_) => {
            // indexes are rebuilt when the resumed run finishes
            println!("  resume     : run again with the same settings to continue");
        }
    }
    Ok(if summary.is_success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn search(raw: &str) -> Result<ExitCode> {
    let opts = IngestOptions::default().from_env()?;
    let store = Store::open(&opts.db_path, 1)?;
    if !store.health_check() {
        bail!("database {} is not usable", opts.db_path.display());
    }
    let params = SearchParams {
        query: Some(raw.to_string()),
        limit: std::env::var("ARCHIVE_SEARCH_LIMIT").ok().map(IntParam::from),
        page: std::env::var("ARCHIVE_SEARCH_PAGE").ok().map(IntParam::from),
        ..SearchParams::default()
    };
    let regex = SafeRegex::default();
    match search_archive(&store, &InputValidator::new(), &regex, &params) {
        Ok(resp) => {
            let body = serde_json::json!({
                "query": resp.parsed.to_string(),
                "total": resp.total,
                "results": resp.results,
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(SearchError::Validation(errors)) => {
            let body = serde_json::json!({
                "errors": errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(ExitCode::from(2))
        }
        Err(e) => Err(e.into()),
    }
}
