//! Publish workflow: one labeled commit per iteration on the run's own branch.
//!
//! Never commits to, pushes to, or checks out a protected ref.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::collab::Vcs;
use crate::error::PublishError;
use crate::run::{is_protected_ref, BranchName, PROTECTED_REFS};

/// How the healing branch was prepared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSetup {
    /// Ref the branch was created from; `None` when an existing branch was reused.
    pub base: Option<String>,
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Committed { sha: String, message: String },
    NoChanges,
}

pub struct PublishWorkflow {
    vcs: Arc<dyn Vcs>,
}

impl PublishWorkflow {
    pub fn new(vcs: Arc<dyn Vcs>) -> Self {
        Self { vcs }
    }

    /// Check out the healing branch, creating it from the first protected ref
    /// that exists. An existing branch with the same name is reused.
    pub async fn prepare_branch(
        &self,
        workdir: &Path,
        branch: &BranchName,
    ) -> Result<BranchSetup, PublishError> {
        guard(branch.as_str())?;

        // A fresh clone only knows an earlier run's branch as a remote-tracking ref.
        for existing in [branch.to_string(), format!("origin/{branch}")] {
            if self.vcs.resolve_ref(workdir, &existing).await?.is_some() {
                info!(branch = %branch, found = %existing, "Reusing existing healing branch");
                self.vcs.checkout(workdir, branch.as_str()).await?;
                return Ok(BranchSetup {
                    base: None,
                    reused: true,
                });
            }
        }

        for candidate in base_ref_candidates() {
            if self.vcs.resolve_ref(workdir, &candidate).await?.is_some() {
                info!(branch = %branch, base = %candidate, "Creating healing branch");
                self.vcs
                    .create_branch(workdir, branch.as_str(), &candidate)
                    .await?;
                return Ok(BranchSetup {
                    base: Some(candidate),
                    reused: false,
                });
            }
        }
        Err(PublishError::NoBaseRef(base_ref_candidates().join(", ")))
    }

    /// Commit and force-push this iteration's changes.
    ///
    /// `applied` is the number of fixes applied this iteration; with zero
    /// applied fixes nothing is committed.
    pub async fn publish(
        &self,
        workdir: &Path,
        branch: &BranchName,
        iteration: u32,
        applied: usize,
    ) -> Result<PublishOutcome, PublishError> {
        if applied == 0 {
            debug!(iteration, "No applied fixes, nothing to publish");
            return Ok(PublishOutcome::NoChanges);
        }
        guard(branch.as_str())?;

        let current = self.vcs.current_branch(workdir).await?;
        if current != branch.as_str() {
            self.vcs.checkout(workdir, branch.as_str()).await?;
            let now_on = self.vcs.current_branch(workdir).await?;
            if now_on != branch.as_str() {
                return Err(PublishError::ProtectedRef(now_on));
            }
        }

        if !self.vcs.has_changes(workdir).await? {
            debug!(iteration, "Working copy has no diff, skipping commit");
            return Ok(PublishOutcome::NoChanges);
        }

        let message = commit_message(applied, iteration);
        let sha = self.vcs.commit_all(workdir, &message).await?;
        self.vcs.push(workdir, branch.as_str()).await?;
        info!(iteration, branch = %branch, %sha, "Published fixes");
        Ok(PublishOutcome::Committed { sha, message })
    }
}

pub fn commit_message(applied: usize, iteration: u32) -> String {
    format!("[AI-AGENT] Fix {applied} issues - iteration {iteration}")
}

/// Local protected refs first, then their remote-tracking counterparts.
fn base_ref_candidates() -> Vec<String> {
    PROTECTED_REFS
        .iter()
        .map(|r| (*r).to_string())
        .chain(PROTECTED_REFS.iter().map(|r| format!("origin/{r}")))
        .collect()
}

fn guard(branch: &str) -> Result<(), PublishError> {
    if is_protected_ref(branch) {
        return Err(PublishError::ProtectedRef(branch.to_string()));
    }
    Ok(())
}
