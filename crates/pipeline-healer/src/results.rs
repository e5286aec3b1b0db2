//! Results file written when a run finalizes.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::events::ProgressLine;
use crate::run::Run;

pub const LATEST_RESULTS_FILE: &str = "results_latest.json";

#[derive(Serialize)]
struct ResultsFile<'a> {
    #[serde(flatten)]
    run: &'a Run,
    progress: &'a [ProgressLine],
}

pub fn results_path(results_dir: &Path, run: &Run) -> PathBuf {
    results_dir.join(format!("results_{}.json", run.id()))
}

/// Write `results_<id>.json` and `results_latest.json`; returns the first path.
pub async fn save(results_dir: &Path, run: &Run, progress: &[ProgressLine]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(results_dir)
        .await
        .with_context(|| format!("Failed to create {}", results_dir.display()))?;

    let body = serde_json::to_string_pretty(&ResultsFile { run, progress })
        .context("Failed to serialize run results")?;

    let path = results_path(results_dir, run);
    tokio::fs::write(&path, &body)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    let latest = results_dir.join(LATEST_RESULTS_FILE);
    tokio::fs::write(&latest, &body)
        .await
        .with_context(|| format!("Failed to write {}", latest.display()))?;

    Ok(path)
}
