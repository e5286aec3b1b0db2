//! The run record and the values it accumulates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use super::branch::BranchName;
use super::score::ScoreBreakdown;
use crate::error::RunError;

/// Default number of healing iterations per run.
pub const DEFAULT_RETRY_BUDGET: u32 = 5;
/// Default CI polling interval in seconds.
pub const DEFAULT_CI_POLL_INTERVAL_SECS: u64 = 10;
/// Default wait for a terminal CI conclusion in seconds.
pub const DEFAULT_CI_TIMEOUT_SECS: u64 = 300;

// =============================================================================
// Identity
// =============================================================================

/// Opaque run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex characters, for directory names and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// =============================================================================
// Classification values
// =============================================================================

/// Failure category, listed in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Syntax,
    Indentation,
    Import,
    TypeError,
    Logic,
    Linting,
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "SYNTAX",
            Self::Indentation => "INDENTATION",
            Self::Import => "IMPORT",
            Self::TypeError => "TYPE_ERROR",
            Self::Logic => "LOGIC",
            Self::Linting => "LINTING",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Short imperative used on the second line of a fix commit message.
    pub fn fix_action(&self) -> &'static str {
        match self {
            Self::Syntax => "fix the syntax error",
            Self::Indentation => "fix the indentation",
            Self::Import => "fix the import statement",
            Self::TypeError => "fix the type mismatch",
            Self::Logic => "fix the logic error",
            Self::Linting => "resolve the lint warning",
            Self::Unknown => "fix the issue",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discovered problem. Line is 1-based, 0 when unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub file: String,
    pub line: u32,
    pub category: Category,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixOutcome {
    Applied,
    FailedToApply,
}

/// One remediation for one file in one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fix {
    pub iteration: u32,
    pub file: String,
    /// Category of the file's first failure.
    pub category: Category,
    /// Every distinct category seen for the file, in first-seen order.
    pub categories: Vec<Category>,
    pub line: u32,
    pub commit_message: String,
    pub outcome: FixOutcome,
}

// =============================================================================
// Verification values
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: u32,
    pub verdict: Verdict,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl IterationResult {
    pub fn new(iteration: u32, verdict: Verdict, message: Option<String>) -> Self {
        Self {
            iteration,
            verdict,
            timestamp: Utc::now(),
            message,
        }
    }
}

/// How a run's iterations are verified. Fixed for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    RemoteCi,
    Local,
}

// =============================================================================
// Lifecycle
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Init,
    Cloned,
    Analyzed,
    Branched,
    Testing,
    Fixing,
    Committing,
    Monitoring,
    Finalized,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Cloned => "Cloned",
            Self::Analyzed => "Analyzed",
            Self::Branched => "Branched",
            Self::Testing => "Testing",
            Self::Fixing => "Fixing",
            Self::Committing => "Committing",
            Self::Monitoring => "Monitoring",
            Self::Finalized => "Finalized",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Passed,
    Failed,
}

/// Why a run finished without passing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    BudgetExhausted,
    Setup { message: String },
    ProtectedRef { message: String },
    Cancelled,
    Internal { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExhausted => f.write_str("retry budget exhausted"),
            Self::Setup { message } => write!(f, "setup failed: {message}"),
            Self::ProtectedRef { message } => write!(f, "protected ref violation: {message}"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: FinalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub elapsed_secs: u64,
    pub commit_count: u32,
    pub score: ScoreBreakdown,
}

/// Inputs accepted at run creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub repo_url: String,
    pub team_name: String,
    pub leader_name: String,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_ci_timeout_secs")]
    pub ci_timeout_secs: u64,
    #[serde(default = "default_ci_poll_interval_secs")]
    pub ci_poll_interval_secs: u64,
}

fn default_retry_budget() -> u32 {
    DEFAULT_RETRY_BUDGET
}

fn default_ci_timeout_secs() -> u64 {
    DEFAULT_CI_TIMEOUT_SECS
}

fn default_ci_poll_interval_secs() -> u64 {
    DEFAULT_CI_POLL_INTERVAL_SECS
}

impl RunConfig {
    pub fn new(repo_url: impl Into<String>, team: impl Into<String>, leader: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            team_name: team.into(),
            leader_name: leader.into(),
            retry_budget: DEFAULT_RETRY_BUDGET,
            ci_timeout_secs: DEFAULT_CI_TIMEOUT_SECS,
            ci_poll_interval_secs: DEFAULT_CI_POLL_INTERVAL_SECS,
        }
    }
}

// =============================================================================
// Run
// =============================================================================

/// One healing attempt.
///
/// Fields are private: every mutation goes through a method that checks the
/// run's invariants (iteration never exceeds the budget, nothing changes after
/// [`Run::finalize`]).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    id: RunId,
    config: RunConfig,
    branch: BranchName,
    verification: VerificationMode,
    stage: Stage,
    iteration: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    workdir: Option<PathBuf>,
    source_files: Vec<String>,
    test_files: Vec<String>,
    failures: Vec<Failure>,
    fixes: Vec<Fix>,
    iterations: Vec<IterationResult>,
    commit_count: u32,
    outcome: Option<RunOutcome>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(
        id: RunId,
        config: RunConfig,
        branch: BranchName,
        verification: VerificationMode,
    ) -> Self {
        Self {
            id,
            config,
            branch,
            verification,
            stage: Stage::Init,
            iteration: 0,
            workdir: None,
            source_files: Vec::new(),
            test_files: Vec::new(),
            failures: Vec::new(),
            fixes: Vec::new(),
            iterations: Vec::new(),
            commit_count: 0,
            outcome: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn branch(&self) -> &BranchName {
        &self.branch
    }

    pub fn verification(&self) -> VerificationMode {
        self.verification
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    pub fn source_files(&self) -> &[String] {
        &self.source_files
    }

    pub fn test_files(&self) -> &[String] {
        &self.test_files
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn fixes(&self) -> &[Fix] {
        &self.fixes
    }

    pub fn iterations(&self) -> &[IterationResult] {
        &self.iterations
    }

    pub fn commit_count(&self) -> u32 {
        self.commit_count
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn is_finalized(&self) -> bool {
        self.outcome.is_some()
    }

    /// Whether another iteration may start.
    pub fn has_budget(&self) -> bool {
        self.iteration < self.config.retry_budget
    }

    /// Most recent verification verdict.
    pub fn last_verdict(&self) -> Option<Verdict> {
        self.iterations.last().map(|r| r.verdict)
    }

    /// Applied fixes recorded for the given iteration.
    pub fn applied_fixes_in(&self, iteration: u32) -> usize {
        self.fixes
            .iter()
            .filter(|f| f.iteration == iteration && f.outcome == FixOutcome::Applied)
            .count()
    }

    fn ensure_open(&self) -> Result<(), RunError> {
        if self.is_finalized() {
            return Err(RunError::Finalized(self.id.to_string()));
        }
        Ok(())
    }

    /// Move to a non-terminal stage. Use [`Run::finalize`] to finish.
    pub fn advance(&mut self, stage: Stage) -> Result<(), RunError> {
        self.ensure_open()?;
        if stage.is_terminal() {
            return Err(RunError::Finalized(self.id.to_string()));
        }
        self.stage = stage;
        Ok(())
    }

    pub fn set_workdir(&mut self, workdir: PathBuf) -> Result<(), RunError> {
        self.ensure_open()?;
        self.workdir = Some(workdir);
        Ok(())
    }

    pub fn set_inventory(
        &mut self,
        source_files: Vec<String>,
        test_files: Vec<String>,
    ) -> Result<(), RunError> {
        self.ensure_open()?;
        self.source_files = source_files;
        self.test_files = test_files;
        Ok(())
    }

    /// Start the next iteration: bumps the counter, enters TESTING and clears
    /// the previous iteration's failures.
    pub fn begin_iteration(&mut self) -> Result<u32, RunError> {
        self.ensure_open()?;
        if !self.has_budget() {
            return Err(RunError::BudgetExhausted(self.config.retry_budget));
        }
        self.iteration += 1;
        self.stage = Stage::Testing;
        self.failures.clear();
        Ok(self.iteration)
    }

    /// Replace the current iteration's failures.
    pub fn record_failures(&mut self, failures: Vec<Failure>) -> Result<(), RunError> {
        self.ensure_open()?;
        self.failures = failures;
        Ok(())
    }

    pub fn record_fixes(&mut self, fixes: impl IntoIterator<Item = Fix>) -> Result<(), RunError> {
        self.ensure_open()?;
        self.fixes.extend(fixes);
        Ok(())
    }

    pub fn record_commit(&mut self) -> Result<(), RunError> {
        self.ensure_open()?;
        self.commit_count += 1;
        Ok(())
    }

    /// Append the verdict for the current iteration. Exactly one per iteration.
    pub fn record_iteration(&mut self, result: IterationResult) -> Result<(), RunError> {
        self.ensure_open()?;
        let already_recorded = self.last_iteration_recorded() == Some(self.iteration);
        if result.iteration != self.iteration || already_recorded {
            return Err(RunError::IterationOutOfOrder {
                got: result.iteration,
                current: self.iteration,
            });
        }
        self.iterations.push(result);
        Ok(())
    }

    fn last_iteration_recorded(&self) -> Option<u32> {
        self.iterations.last().map(|r| r.iteration)
    }

    /// Set the outcome, compute the score and freeze the run.
    pub fn finalize(
        &mut self,
        status: FinalStatus,
        reason: Option<FailureReason>,
        elapsed_secs: u64,
    ) -> Result<&RunOutcome, RunError> {
        self.ensure_open()?;
        self.stage = Stage::Finalized;
        self.ended_at = Some(Utc::now());
        let outcome = self.outcome.insert(RunOutcome {
            status,
            reason,
            elapsed_secs,
            commit_count: self.commit_count,
            score: ScoreBreakdown::compute(elapsed_secs, self.commit_count),
        });
        Ok(outcome)
    }
}
