//! JSON report output.
//!
//! The whole [`RunResult`] envelope is written, so partial results of failed
//! and cancelled runs are preserved alongside their errors.

use crate::error::Result;
use crate::pipeline::RunResult;
use std::path::PathBuf;
use tokio::fs;
use tracing::{error, info, instrument};

/// Path of the report for `result` under `json_output_dir`:
/// `{json_output_dir}/{YYYY-MM-DD}/{run_id}.json`, dated by the run's start.
pub fn report_path(result: &RunResult, json_output_dir: &str) -> PathBuf {
    PathBuf::from(json_output_dir)
        .join(result.started_at.format("%Y-%m-%d").to_string())
        .join(format!("{}.json", result.run_id))
}

/// Serialize a [`RunResult`] to its dated JSON file, creating directories as
/// needed. Returns the written path.
#[instrument(level = "info", skip_all, fields(json_output_dir = %json_output_dir, run_id = %result.run_id))]
pub async fn write_report(result: &RunResult, json_output_dir: &str) -> Result<PathBuf> {
    let json = serde_json::to_string_pretty(result)?;
    let path = report_path(result, json_output_dir);

    if let Some(dir) = path.parent() {
        info!(dir = %dir.display(), "Ensuring JSON directory exists");
        if let Err(e) = fs::create_dir_all(dir).await {
            error!(dir = %dir.display(), error = %e, "Failed to create JSON dir");
            return Err(e.into());
        }
    }

    fs::write(&path, json).await?;
    info!(path = %path.display(), "Wrote JSON report");
    Ok(path)
}
