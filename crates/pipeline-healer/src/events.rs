//! Progress events published by a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::{Run, RunId, RunOutcome, Stage};

/// Events observers may subscribe to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Free-text progress line
    Progress {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Snapshot taken after a stage transition
    Stage {
        snapshot: RunSummary,
        timestamp: DateTime<Utc>,
    },

    /// Final outcome; the last event of every run
    Finished {
        run_id: RunId,
        outcome: RunOutcome,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn progress(message: impl Into<String>) -> Self {
        Self::Progress {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn stage(run: &Run) -> Self {
        Self::Stage {
            snapshot: RunSummary::from(run),
            timestamp: Utc::now(),
        }
    }

    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Stage { .. } => "stage",
            Self::Finished { .. } => "finished",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

/// Compact view of a run, used in stage events and result listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub repo_url: String,
    pub branch: String,
    pub stage: Stage,
    pub iteration: u32,
    pub retry_budget: u32,
    pub failures: usize,
    pub fixes: usize,
    pub commits: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id(),
            repo_url: run.config().repo_url.clone(),
            branch: run.branch().to_string(),
            stage: run.stage(),
            iteration: run.iteration(),
            retry_budget: run.config().retry_budget,
            failures: run.failures().len(),
            fixes: run.fixes().len(),
            commits: run.commit_count(),
            outcome: run.outcome().cloned(),
        }
    }
}

/// A retained progress line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}
