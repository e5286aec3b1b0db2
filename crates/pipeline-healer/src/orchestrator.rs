//! Run orchestrator.
//!
//! Drives one run through its stages:
//!
//! ```text
//! INIT -> CLONED -> ANALYZED -> BRANCHED -> TESTING -> FIXING -> COMMITTING -> MONITORING
//!                                              ^                                  |
//!                                              +------------- next iteration -----+
//! ```
//!
//! and into FINALIZED when checks pass, verification passes, the retry budget
//! runs out, setup fails, or the run is cancelled.
//!
//! The orchestrator owns the run record while it works and is its only writer.
//! Workflows receive the fields they need and return values; after each stage
//! the record is copied into the registry for readers.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::classify::classify_all;
use crate::collab::{CiTarget, Collaborators};
use crate::config::HealerConfig;
use crate::error::{PublishError, RegistryError, RunError, SetupError};
use crate::events::ProgressEvent;
use crate::patch::PatchWorkflow;
use crate::publish::{PublishOutcome, PublishWorkflow};
use crate::registry::{RunHandle, RunRegistry};
use crate::results;
use crate::run::{
    BranchName, FailureReason, FinalStatus, IterationResult, Run, RunConfig, RunId, Stage,
    Verdict, VerificationMode,
};
use crate::verify::{Cancelled, VerificationMonitor, VerifyRequest};

/// Request to start a run.
#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub repo_url: String,
    pub team_name: String,
    pub leader_name: String,
    #[serde(default)]
    pub retry_budget: Option<u32>,
}

/// Why the healing loop stopped.
#[derive(Debug)]
enum Termination {
    Passed,
    BudgetExhausted,
    Setup(SetupError),
    ProtectedRef(PublishError),
    Cancelled,
    Internal(RunError),
}

impl Termination {
    fn into_outcome(self) -> (FinalStatus, Option<FailureReason>) {
        match self {
            Self::Passed => (FinalStatus::Passed, None),
            Self::BudgetExhausted => (FinalStatus::Failed, Some(FailureReason::BudgetExhausted)),
            Self::Setup(e) => (
                FinalStatus::Failed,
                Some(FailureReason::Setup {
                    message: e.to_string(),
                }),
            ),
            Self::ProtectedRef(e) => (
                FinalStatus::Failed,
                Some(FailureReason::ProtectedRef {
                    message: e.to_string(),
                }),
            ),
            Self::Cancelled => (FinalStatus::Failed, Some(FailureReason::Cancelled)),
            Self::Internal(e) => (
                FinalStatus::Failed,
                Some(FailureReason::Internal {
                    message: e.to_string(),
                }),
            ),
        }
    }
}

pub struct Orchestrator {
    config: Arc<HealerConfig>,
    collab: Collaborators,
    registry: RunRegistry,
    patch: PatchWorkflow,
    publish: PublishWorkflow,
}

impl Orchestrator {
    pub fn new(config: HealerConfig, collab: Collaborators, registry: RunRegistry) -> Self {
        let patch = PatchWorkflow::new(collab.codegen.clone(), config.codegen_timeout());
        let publish = PublishWorkflow::new(collab.vcs.clone());
        Self {
            config: Arc::new(config),
            collab,
            registry,
            patch,
            publish,
        }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn config(&self) -> &HealerConfig {
        &self.config
    }

    /// Validate a request and register the run. Nothing executes yet.
    pub async fn create_run(&self, request: RunRequest) -> Result<Arc<RunHandle>, RegistryError> {
        let repo_url = request.repo_url.trim().to_string();
        if repo_url.is_empty() {
            return Err(RegistryError::InvalidRequest("repo_url is required".into()));
        }
        let retry_budget = request.retry_budget.unwrap_or(self.config.retry_budget);
        if retry_budget == 0 {
            return Err(RegistryError::InvalidRequest(
                "retry_budget must be at least 1".into(),
            ));
        }
        let branch = BranchName::from_tokens(&request.team_name, &request.leader_name)?;

        let verification = match &self.collab.ci {
            Some(ci) if ci.supports(&repo_url) => VerificationMode::RemoteCi,
            _ => VerificationMode::Local,
        };

        let config = RunConfig {
            repo_url,
            team_name: request.team_name,
            leader_name: request.leader_name,
            retry_budget,
            ci_timeout_secs: self.config.ci_timeout_secs,
            ci_poll_interval_secs: self.config.ci_poll_interval_secs,
        };
        let run = Run::new(RunId::new(), config, branch, verification);
        info!(
            run_id = %run.id(),
            repo = %run.config().repo_url,
            branch = %run.branch(),
            ?verification,
            "Run created"
        );
        Ok(self.registry.insert(run).await)
    }

    /// Execute a registered run on its own task.
    pub fn spawn(self: &Arc<Self>, handle: Arc<RunHandle>) -> JoinHandle<Run> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.execute(handle).await })
    }

    /// Create and spawn in one step.
    pub async fn start(self: &Arc<Self>, request: RunRequest) -> Result<Arc<RunHandle>, RegistryError> {
        let handle = self.create_run(request).await?;
        self.spawn(handle.clone());
        Ok(handle)
    }

    /// Run to completion. Always returns a finalized run.
    pub async fn execute(&self, handle: Arc<RunHandle>) -> Run {
        let mut run = handle.snapshot().await;
        let started = self.collab.clock.now();
        let cancel = handle.cancel_token();

        info!(run_id = %run.id(), "Starting healing run");
        let termination = match self.drive(&mut run, &handle, &cancel).await {
            Ok(termination) => termination,
            Err(e) => {
                error!(run_id = %run.id(), error = %e, "Run state violation");
                Termination::Internal(e)
            }
        };
        self.finish(&mut run, &handle, termination, started).await;
        run
    }

    async fn drive(
        &self,
        run: &mut Run,
        handle: &RunHandle,
        cancel: &CancellationToken,
    ) -> Result<Termination, RunError> {
        // CLONED
        let workdir = working_copy_path(&self.config.repos_dir, run);
        self.say(handle, format!("Cloning {}", run.config().repo_url)).await;
        if let Err(e) = self
            .collab
            .vcs
            .clone_repo(&run.config().repo_url, &workdir)
            .await
        {
            return Ok(Termination::Setup(SetupError::Clone(e)));
        }
        run.set_workdir(workdir.clone())?;
        self.enter(run, handle, Stage::Cloned).await?;

        // ANALYZED
        let inventory = match self.collab.discovery.discover(&workdir).await {
            Ok(inventory) => inventory,
            Err(e) => return Ok(Termination::Setup(e)),
        };
        run.set_inventory(inventory.source_files.clone(), inventory.test_files.clone())?;
        self.say(
            handle,
            format!(
                "Found {} source files, {} of them tests",
                inventory.source_files.len(),
                inventory.test_files.len()
            ),
        )
        .await;
        self.enter(run, handle, Stage::Analyzed).await?;

        // BRANCHED
        match self.publish.prepare_branch(&workdir, run.branch()).await {
            Ok(setup) => {
                let message = match setup.base {
                    Some(base) => format!("Created branch {} from {}", run.branch(), base),
                    None => format!("Reusing branch {}", run.branch()),
                };
                self.say(handle, message).await;
            }
            Err(e) if e.is_fatal() => return Ok(Termination::ProtectedRef(e)),
            Err(e) => return Ok(Termination::Setup(SetupError::Branch(e))),
        }
        self.enter(run, handle, Stage::Branched).await?;

        let monitor = self.monitor_for(run);

        loop {
            if cancel.is_cancelled() {
                return Ok(Termination::Cancelled);
            }

            // TESTING
            let iteration = run.begin_iteration()?;
            self.checkpoint(run, handle).await?;
            self.say(
                handle,
                format!(
                    "Iteration {}/{}: running checks",
                    iteration,
                    run.config().retry_budget
                ),
            )
            .await;

            let checked = tokio::select! {
                () = cancel.cancelled() => return Ok(Termination::Cancelled),
                checked = self.collab.checks.run_checks(&workdir, &inventory) => checked,
            };
            let mut diagnostics = match checked {
                Ok(diagnostics) => diagnostics,
                Err(e) => {
                    warn!(run_id = %run.id(), iteration, error = %e, "Checks could not run");
                    let result = IterationResult::new(
                        iteration,
                        Verdict::Failed,
                        Some(format!("Checks could not run: {e}")),
                    );
                    run.record_iteration(result)?;
                    self.checkpoint(run, handle).await?;
                    if run.has_budget() {
                        continue;
                    }
                    return Ok(Termination::BudgetExhausted);
                }
            };
            let root = workdir.display().to_string();
            for diagnostic in &mut diagnostics {
                diagnostic.root.get_or_insert_with(|| root.clone());
            }
            run.record_failures(classify_all(&diagnostics))?;

            if run.failures().is_empty() {
                self.say(handle, "All checks pass").await;
                return Ok(Termination::Passed);
            }
            self.say(handle, format!("Found {} failures", run.failures().len()))
                .await;

            // FIXING
            self.enter(run, handle, Stage::Fixing).await?;
            let failures = run.failures().to_vec();
            let report = self.patch.apply(&workdir, iteration, &failures).await;
            let applied = report.applied_count();
            let skipped = report.skipped.len();
            run.record_fixes(report.fixes)?;
            self.say(
                handle,
                format!("Applied {applied} fixes, skipped {skipped} files"),
            )
            .await;

            // COMMITTING
            self.enter(run, handle, Stage::Committing).await?;
            let published = self
                .publish
                .publish(&workdir, run.branch(), iteration, applied)
                .await;
            let commit = match published {
                Ok(PublishOutcome::Committed { sha, .. }) => {
                    run.record_commit()?;
                    self.say(handle, format!("Pushed commit {sha}")).await;
                    Some(sha)
                }
                Ok(PublishOutcome::NoChanges) => {
                    self.say(handle, "No changes to commit").await;
                    None
                }
                Err(e) if e.is_fatal() => return Ok(Termination::ProtectedRef(e)),
                Err(e) => {
                    warn!(run_id = %run.id(), iteration, error = %e, "Publish failed");
                    let result = IterationResult::new(
                        iteration,
                        Verdict::Failed,
                        Some(format!("Publish failed: {e}")),
                    );
                    run.record_iteration(result)?;
                    self.checkpoint(run, handle).await?;
                    if run.has_budget() {
                        continue;
                    }
                    return Ok(Termination::BudgetExhausted);
                }
            };

            // MONITORING
            self.enter(run, handle, Stage::Monitoring).await?;
            let target = self.ci_target(run, &workdir, commit).await;
            let request = VerifyRequest {
                iteration,
                target,
                workdir: &workdir,
                inventory: &inventory,
            };
            let result = match monitor.verify(request, cancel).await {
                Ok(result) => result,
                Err(Cancelled) => return Ok(Termination::Cancelled),
            };
            let verdict = result.verdict;
            self.say(
                handle,
                format!(
                    "Iteration {iteration} verification: {}",
                    result.message.as_deref().unwrap_or(verdict_label(verdict))
                ),
            )
            .await;
            run.record_iteration(result)?;
            self.checkpoint(run, handle).await?;

            if verdict == Verdict::Passed {
                return Ok(Termination::Passed);
            }
            if !run.has_budget() {
                return Ok(Termination::BudgetExhausted);
            }
        }
    }

    async fn finish(&self, run: &mut Run, handle: &RunHandle, termination: Termination, started: Instant) {
        let elapsed = self
            .collab
            .clock
            .now()
            .saturating_duration_since(started)
            .as_secs();
        let (status, reason) = termination.into_outcome();

        let outcome = match run.finalize(status, reason, elapsed) {
            Ok(outcome) => outcome.clone(),
            Err(e) => {
                error!(run_id = %run.id(), error = %e, "Run finalized twice");
                return;
            }
        };
        info!(
            run_id = %run.id(),
            status = ?outcome.status,
            iterations = run.iteration(),
            commits = outcome.commit_count,
            score = outcome.score.total,
            elapsed_secs = elapsed,
            "Run finalized"
        );

        if let Err(e) = handle.store(run).await {
            error!(run_id = %run.id(), error = %e, "Failed to store final run record");
        }
        if let Some(reason) = &outcome.reason {
            self.say(handle, format!("Run failed: {reason}")).await;
        }
        handle
            .emit(ProgressEvent::Finished {
                run_id: run.id(),
                outcome,
                timestamp: chrono::Utc::now(),
            })
            .await;

        let progress = handle.progress_lines().await;
        match results::save(&self.config.results_dir, run, &progress).await {
            Ok(path) => info!(run_id = %run.id(), path = %path.display(), "Results saved"),
            Err(e) => warn!(run_id = %run.id(), error = %format!("{e:#}"), "Failed to save results"),
        }
    }

    fn monitor_for(&self, run: &Run) -> VerificationMonitor {
        match (run.verification(), &self.collab.ci) {
            (VerificationMode::RemoteCi, Some(ci)) => VerificationMonitor::remote(
                ci.clone(),
                self.collab.clock.clone(),
                Duration::from_secs(run.config().ci_poll_interval_secs),
                Duration::from_secs(run.config().ci_timeout_secs),
                self.config.ci_request_timeout(),
            ),
            _ => VerificationMonitor::local(self.collab.checks.clone()),
        }
    }

    /// Commit to verify: this iteration's commit, else the branch head.
    async fn ci_target(&self, run: &Run, workdir: &Path, commit: Option<String>) -> CiTarget {
        let commit = match commit {
            Some(sha) => sha,
            None if run.verification() == VerificationMode::RemoteCi => {
                match self.collab.vcs.head(workdir).await {
                    Ok(sha) => sha,
                    Err(e) => {
                        warn!(run_id = %run.id(), error = %e, "Could not resolve branch head");
                        String::new()
                    }
                }
            }
            None => String::new(),
        };
        CiTarget {
            repo_url: run.config().repo_url.clone(),
            branch: run.branch().to_string(),
            commit,
        }
    }

    async fn enter(&self, run: &mut Run, handle: &RunHandle, stage: Stage) -> Result<(), RunError> {
        run.advance(stage)?;
        self.checkpoint(run, handle).await
    }

    async fn checkpoint(&self, run: &Run, handle: &RunHandle) -> Result<(), RunError> {
        handle.store(run).await?;
        handle.emit(ProgressEvent::stage(run)).await;
        Ok(())
    }

    async fn say(&self, handle: &RunHandle, message: impl Into<String>) {
        let message = message.into();
        info!(run_id = %handle.id(), "{}", message);
        handle.emit(ProgressEvent::progress(message)).await;
    }
}

fn verdict_label(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Passed => "passed",
        Verdict::Failed => "failed",
        Verdict::TimedOut => "timed out",
    }
}

/// Isolated working copy path: `<repos_dir>/<repo>_<millis>_<run>`.
fn working_copy_path(repos_dir: &Path, run: &Run) -> PathBuf {
    let millis = chrono::Utc::now().timestamp_millis();
    repos_dir.join(format!(
        "{}_{}_{}",
        repo_name(&run.config().repo_url),
        millis,
        run.id().short()
    ))
}

/// Last path segment of a repository URL, safe for use as a directory name.
pub fn repo_name(url: &str) -> String {
    let name: String = url
        .trim()
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        "repo".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_name() {
        assert_eq!(repo_name("https://github.com/acme/app.git"), "app");
        assert_eq!(repo_name("https://github.com/acme/app/"), "app");
        assert_eq!(repo_name("git@github.com:acme/tool-kit.git"), "tool-kit");
        assert_eq!(repo_name(""), "repo");
        assert_eq!(repo_name("https://example.com/.."), "repo");
    }

    #[test]
    fn test_termination_outcomes() {
        assert_eq!(Termination::Passed.into_outcome(), (FinalStatus::Passed, None));
        assert_eq!(
            Termination::BudgetExhausted.into_outcome(),
            (FinalStatus::Failed, Some(FailureReason::BudgetExhausted))
        );
        assert_eq!(
            Termination::Cancelled.into_outcome(),
            (FinalStatus::Failed, Some(FailureReason::Cancelled))
        );
    }
}
