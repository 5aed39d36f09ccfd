//! # News Analyzer CLI
//!
//! Runs one analysis from the command line: fetch the given sources, keep the
//! articles relevant to a business interest, summarize them, and write JSON
//! and Markdown reports.
//!
//! ## Usage
//!
//! ```sh
//! news_analyzer -i "EV market" -s https://example.com/business -j ./json -m ./markdown
//! ```
//!
//! Ctrl-C cancels the run; whatever was finished is still written out.

use clap::Parser;
use itertools::Itertools;
use news_analyzer::outputs::{json, markdown};
use news_analyzer::utils::ensure_writable_dir;
use news_analyzer::{Analyzer, AnalyzerConfig, Phase, RunHandle};
use std::error::Error;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;

use cli::Cli;

/// Sources from the command line followed by those in the sources file,
/// without duplicates.
async fn collect_sources(args: &Cli) -> Result<Vec<String>, Box<dyn Error>> {
    let mut sources = args.sources.clone();
    if let Some(path) = &args.sources_file {
        let raw = tokio::fs::read_to_string(path).await?;
        let from_file: Vec<String> = serde_json::from_str(&raw)?;
        info!(path = %path, count = from_file.len(), "Loaded sources file");
        sources.extend(from_file);
    }
    Ok(sources
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unique()
        .collect())
}

/// Log every phase transition and progress milestone until the run ends.
fn spawn_progress_logger(handle: &RunHandle) {
    let mut rx = handle.subscribe();
    tokio::spawn(async move {
        let mut last = Phase::Idle;
        while rx.changed().await.is_ok() {
            let status = rx.borrow_and_update().clone();
            if status.phase != last {
                info!(
                    phase = %status.phase,
                    fetched = status.counts.fetched,
                    relevant = status.counts.relevant,
                    summarized = status.counts.summarized,
                    "Run progress"
                );
                last = status.phase;
            }
            if status.phase.is_terminal() {
                break;
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("news_analyzer starting up");

    let args = Cli::parse();
    debug!(?args.json_output_dir, ?args.markdown_output_dir, "Parsed CLI arguments");

    let mut config = match &args.config {
        Some(path) => AnalyzerConfig::load(path).await?,
        None => AnalyzerConfig::default(),
    };
    if let Some(key) = &args.api_key {
        config.inference.api_key = Some(key.clone());
    }
    if config.inference.resolved_api_key().is_none() {
        warn!("No API key configured; inference calls will likely be rejected");
    }

    // Early check: output dirs must be writable before spending on inference
    for dir in [&args.json_output_dir, &args.markdown_output_dir]
        .into_iter()
        .flatten()
    {
        if let Err(e) = ensure_writable_dir(dir).await {
            error!(path = %dir, error = %e, "Output directory is not writable");
            return Err(e.into());
        }
    }

    let sources = collect_sources(&args).await?;
    let snapshot_path = config.cache.snapshot_path.clone();
    let analyzer = Analyzer::from_config(config)?;

    if let Some(path) = &snapshot_path {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            match analyzer.cache().load_snapshot(path).await {
                Ok(load) => info!(
                    path = %path.display(),
                    loaded = load.loaded,
                    discarded = load.discarded,
                    expired = load.expired,
                    "Loaded cache snapshot"
                ),
                Err(e) => warn!(path = %path.display(), error = %e, "Ignoring unreadable cache snapshot"),
            }
        }
    }

    let handle = analyzer.start_analysis(sources, args.interest.as_str());
    spawn_progress_logger(&handle);

    let wait = handle.wait();
    tokio::pin!(wait);
    let result = tokio::select! {
        r = &mut wait => r?,
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %handle.id(), "Interrupted; cancelling run");
            handle.cancel();
            wait.await?
        }
    };

    // ---- Reports ----
    if let Some(dir) = &args.json_output_dir {
        if let Err(e) = json::write_report(&result, dir).await {
            error!(error = %e, "Failed writing JSON report");
        }
    }
    if let Some(dir) = &args.markdown_output_dir {
        if let Err(e) = markdown::write_markdown(&result, dir).await {
            error!(error = %e, "Failed writing Markdown report");
        }
    }

    if let Some(path) = &snapshot_path {
        match analyzer.cache().save_snapshot(path).await {
            Ok(saved) => info!(path = %path.display(), saved, "Saved cache snapshot"),
            Err(e) => error!(path = %path.display(), error = %e, "Failed saving cache snapshot"),
        }
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        phase = %result.phase,
        total = result.total_articles,
        relevant = result.relevant_articles,
        summarized = result.summarized_articles.len(),
        cache_hits = result.cache.hits,
        "Execution complete"
    );

    if result.phase == Phase::Failed {
        let reason = result.error.clone().unwrap_or_else(|| "run failed".to_string());
        return Err(reason.into());
    }
    Ok(())
}
