//! Verification of an iteration's published state.
//!
//! A run verifies either against remote CI (poll until a terminal conclusion
//! or the timeout) or by re-running the checks locally. The strategy is picked
//! once when the run is created and never changes.

pub mod clock;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use clock::{Clock, ManualClock, SystemClock};

use crate::classify::classify_all;
use crate::collab::{CheckRunner, CiConclusion, CiStatus, CiStatusSource, CiTarget, Inventory};
use crate::error::CiStatusError;
use crate::run::{IterationResult, Verdict, VerificationMode};

/// The owning run was cancelled while verifying.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Verification cancelled")]
pub struct Cancelled;

/// Inputs for verifying one iteration.
pub struct VerifyRequest<'a> {
    pub iteration: u32,
    pub target: CiTarget,
    pub workdir: &'a Path,
    pub inventory: &'a Inventory,
}

enum Strategy {
    Remote {
        source: Arc<dyn CiStatusSource>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        timeout: Duration,
        request_timeout: Duration,
    },
    Local(Arc<dyn CheckRunner>),
}

pub struct VerificationMonitor {
    strategy: Strategy,
}

impl VerificationMonitor {
    pub fn remote(
        source: Arc<dyn CiStatusSource>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            strategy: Strategy::Remote {
                source,
                clock,
                poll_interval,
                timeout,
                request_timeout,
            },
        }
    }

    pub fn local(checks: Arc<dyn CheckRunner>) -> Self {
        Self {
            strategy: Strategy::Local(checks),
        }
    }

    pub fn mode(&self) -> VerificationMode {
        match self.strategy {
            Strategy::Remote { .. } => VerificationMode::RemoteCi,
            Strategy::Local(_) => VerificationMode::Local,
        }
    }

    /// Produce exactly one result for the iteration, or `Cancelled`.
    pub async fn verify(
        &self,
        request: VerifyRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<IterationResult, Cancelled> {
        match &self.strategy {
            Strategy::Remote {
                source,
                clock,
                poll_interval,
                timeout,
                request_timeout,
            } => {
                let poller = Poller {
                    source: source.as_ref(),
                    clock: clock.as_ref(),
                    poll_interval: *poll_interval,
                    timeout: *timeout,
                    request_timeout: *request_timeout,
                };
                poller.run(request.iteration, &request.target, cancel).await
            }
            Strategy::Local(checks) => {
                tokio::select! {
                    () = cancel.cancelled() => Err(Cancelled),
                    result = verify_locally(checks.as_ref(), &request) => Ok(result),
                }
            }
        }
    }
}

struct Poller<'a> {
    source: &'a dyn CiStatusSource,
    clock: &'a dyn Clock,
    poll_interval: Duration,
    timeout: Duration,
    request_timeout: Duration,
}

impl Poller<'_> {
    async fn run(
        &self,
        iteration: u32,
        target: &CiTarget,
        cancel: &CancellationToken,
    ) -> Result<IterationResult, Cancelled> {
        let deadline = self.clock.now() + self.timeout;
        let mut polls = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }

            polls += 1;
            match self.poll_once(target).await {
                Ok(CiStatus::Completed(conclusion)) => {
                    info!(iteration, commit = %target.commit, ?conclusion, polls, "CI reached a conclusion");
                    return Ok(conclusion_result(iteration, conclusion));
                }
                Ok(CiStatus::Running) => {
                    debug!(iteration, commit = %target.commit, polls, "CI still running");
                }
                Err(e) => {
                    warn!(iteration, commit = %target.commit, error = %e, "CI status poll failed");
                }
            }

            let now = self.clock.now();
            if now >= deadline {
                let secs = self.timeout.as_secs();
                warn!(iteration, polls, "CI did not conclude within {}s", secs);
                return Ok(IterationResult::new(
                    iteration,
                    Verdict::TimedOut,
                    Some(format!("CI did not conclude within {secs}s ({polls} polls)")),
                ));
            }

            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                () = cancel.cancelled() => return Err(Cancelled),
                () = self.clock.sleep(wait) => {}
            }
        }
    }

    async fn poll_once(&self, target: &CiTarget) -> Result<CiStatus, CiStatusError> {
        tokio::time::timeout(self.request_timeout, self.source.status(target))
            .await
            .unwrap_or(Err(CiStatusError::Timeout))
    }
}

fn conclusion_result(iteration: u32, conclusion: CiConclusion) -> IterationResult {
    let (verdict, message) = match conclusion {
        CiConclusion::Success => (Verdict::Passed, "CI passed"),
        CiConclusion::Failure => (Verdict::Failed, "CI failed"),
        CiConclusion::Cancelled => (Verdict::Failed, "CI run was cancelled"),
    };
    IterationResult::new(iteration, verdict, Some(message.to_string()))
}

async fn verify_locally(checks: &dyn CheckRunner, request: &VerifyRequest<'_>) -> IterationResult {
    let iteration = request.iteration;
    match checks.run_checks(request.workdir, request.inventory).await {
        Ok(diagnostics) => {
            let remaining = classify_all(&diagnostics).len();
            if remaining == 0 {
                IterationResult::new(iteration, Verdict::Passed, Some("Local checks passed".into()))
            } else {
                IterationResult::new(
                    iteration,
                    Verdict::Failed,
                    Some(format!("{remaining} failures remain after local re-run")),
                )
            }
        }
        Err(e) => {
            warn!(iteration, error = %e, "Local verification could not run");
            IterationResult::new(iteration, Verdict::Failed, Some(format!("Local checks failed to run: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Diagnostic, Toolchain};
    use crate::error::CheckError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Reports `Running` until `completes_after` polls, then the conclusion.
    struct ScriptedCi {
        polls: AtomicU32,
        completes_after: Option<u32>,
        conclusion: CiConclusion,
    }

    #[async_trait]
    impl CiStatusSource for ScriptedCi {
        fn supports(&self, _repo_url: &str) -> bool {
            true
        }

        async fn status(&self, _target: &CiTarget) -> Result<CiStatus, CiStatusError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.completes_after {
                Some(after) if n >= after => Ok(CiStatus::Completed(self.conclusion)),
                _ => Ok(CiStatus::Running),
            }
        }
    }

    struct FixedChecks(Mutex<Vec<Result<Vec<Diagnostic>, CheckError>>>);

    #[async_trait]
    impl CheckRunner for FixedChecks {
        async fn run_checks(
            &self,
            _workdir: &Path,
            _inventory: &Inventory,
        ) -> Result<Vec<Diagnostic>, CheckError> {
            self.0.lock().unwrap().remove(0)
        }
    }

    fn target() -> CiTarget {
        CiTarget {
            repo_url: "https://github.com/acme/app".into(),
            branch: "TEAM_LEAD_AI_Fix".into(),
            commit: "abc123".into(),
        }
    }

    fn remote(ci: Arc<ScriptedCi>, clock: Arc<ManualClock>) -> VerificationMonitor {
        VerificationMonitor::remote(
            ci,
            clock,
            Duration::from_secs(10),
            Duration::from_secs(300),
            Duration::from_secs(30),
        )
    }

    fn request<'a>(inventory: &'a Inventory) -> VerifyRequest<'a> {
        VerifyRequest {
            iteration: 1,
            target: target(),
            workdir: Path::new("/tmp/none"),
            inventory,
        }
    }

    #[tokio::test]
    async fn test_remote_success_after_polls() {
        let ci = Arc::new(ScriptedCi {
            polls: AtomicU32::new(0),
            completes_after: Some(4),
            conclusion: CiConclusion::Success,
        });
        let clock = Arc::new(ManualClock::new());
        let monitor = remote(ci.clone(), clock.clone());
        let inventory = Inventory::default();

        let result = monitor
            .verify(request(&inventory), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.verdict, Verdict::Passed);
        assert_eq!(ci.polls.load(Ordering::SeqCst), 4);
        assert_eq!(clock.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_remote_failure_conclusion() {
        let ci = Arc::new(ScriptedCi {
            polls: AtomicU32::new(0),
            completes_after: Some(1),
            conclusion: CiConclusion::Failure,
        });
        let monitor = remote(ci, Arc::new(ManualClock::new()));
        let inventory = Inventory::default();
        let result = monitor
            .verify(request(&inventory), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.verdict, Verdict::Failed);
    }

    #[tokio::test]
    async fn test_remote_times_out_distinctly() {
        let ci = Arc::new(ScriptedCi {
            polls: AtomicU32::new(0),
            completes_after: None,
            conclusion: CiConclusion::Success,
        });
        let clock = Arc::new(ManualClock::new());
        let monitor = remote(ci.clone(), clock.clone());
        let inventory = Inventory::default();

        let result = monitor
            .verify(request(&inventory), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.verdict, Verdict::TimedOut);
        assert_eq!(clock.elapsed(), Duration::from_secs(300));
        // One poll at t=0 and one after each 10s wait up to t=300.
        assert_eq!(ci.polls.load(Ordering::SeqCst), 31);
    }

    #[tokio::test]
    async fn test_remote_cancelled() {
        let ci = Arc::new(ScriptedCi {
            polls: AtomicU32::new(0),
            completes_after: None,
            conclusion: CiConclusion::Success,
        });
        let monitor = remote(ci, Arc::new(ManualClock::new()));
        let inventory = Inventory::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = monitor.verify(request(&inventory), &cancel).await;
        assert_eq!(result, Err(Cancelled));
    }

    #[tokio::test]
    async fn test_local_pass_and_fail() {
        let checks = Arc::new(FixedChecks(Mutex::new(vec![
            Ok(vec![Diagnostic::new(
                Toolchain::Flake8,
                "a.py:1:1: F401 'os' imported but unused",
                true,
            )]),
            Ok(vec![Diagnostic::new(Toolchain::Pytest, "1 passed", false)]),
        ])));
        let monitor = VerificationMonitor::local(checks);
        assert_eq!(monitor.mode(), VerificationMode::Local);
        let inventory = Inventory::default();
        let cancel = CancellationToken::new();

        let first = monitor.verify(request(&inventory), &cancel).await.unwrap();
        assert_eq!(first.verdict, Verdict::Failed);
        let second = monitor.verify(request(&inventory), &cancel).await.unwrap();
        assert_eq!(second.verdict, Verdict::Passed);
    }

    #[tokio::test]
    async fn test_local_check_error_is_failed_verdict() {
        let checks = Arc::new(FixedChecks(Mutex::new(vec![Err(CheckError::Other(
            "python not found".into(),
        ))])));
        let monitor = VerificationMonitor::local(checks);
        let inventory = Inventory::default();
        let result = monitor
            .verify(request(&inventory), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.verdict, Verdict::Failed);
        assert!(result.message.unwrap().contains("python not found"));
    }
}
