//! Error types for the healing engine.
//!
//! Each collaborator seam has its own error enum so the orchestrator can
//! tell fatal setup failures apart from per-iteration failures.

use thiserror::Error;

/// Errors that abort a run before the healing loop starts.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Working copy could not be obtained
    #[error("Failed to clone repository: {0}")]
    Clone(#[source] VcsError),

    /// Source inventory could not be built
    #[error("Failed to discover sources in {path}: {message}")]
    Discovery { path: String, message: String },

    /// Healing branch could not be prepared
    #[error("Failed to prepare branch: {0}")]
    Branch(#[source] PublishError),
}

/// Errors raised while running the project's checkers.
#[derive(Debug, Error)]
pub enum CheckError {
    /// Checker process could not be started
    #[error("Failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Checker exceeded its time limit
    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// Checker failed for another reason
    #[error("{0}")]
    Other(String),
}

/// Errors from the code generation collaborator.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// Generator declined to propose a change
    #[error("No confident fix available")]
    NoConfidentFix,

    /// Generator did not answer in time
    #[error("Code generation timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Generator is missing credentials
    #[error("Code generator not configured: {0}")]
    NotConfigured(String),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote API returned an error
    #[error("Code generation API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Prompt could not be rendered
    #[error("Failed to render prompt: {0}")]
    Prompt(String),
}

/// Errors from the patch workflow for a single target file.
#[derive(Debug, Error)]
pub enum PatchError {
    /// Failure location is not inside the working copy
    #[error("Refusing to patch path outside the working copy: {0}")]
    OutsideWorkdir(String),

    /// Target file could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Target file could not be written
    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Generator produced no usable content
    #[error(transparent)]
    Codegen(#[from] CodegenError),
}

/// Errors from the version control collaborator.
#[derive(Debug, Error)]
pub enum VcsError {
    /// A git command exited unsuccessfully
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    /// A git command could not be started
    #[error("Failed to run git: {0}")]
    Io(#[from] std::io::Error),

    /// A write was attempted against a protected ref
    #[error("Refusing to write to protected ref `{0}`")]
    ProtectedRef(String),
}

/// Errors from the publish workflow.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The run tried to commit or push to a protected ref
    #[error("Refusing to publish to protected ref `{0}`")]
    ProtectedRef(String),

    /// None of the known base refs exist
    #[error("No base branch found (tried {0})")]
    NoBaseRef(String),

    /// Underlying version control failure
    #[error(transparent)]
    Vcs(#[from] VcsError),
}

impl PublishError {
    /// Protected-ref violations end the run rather than the iteration.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtectedRef(_) | Self::Vcs(VcsError::ProtectedRef(_))
        )
    }
}

/// Errors from a remote CI status source.
#[derive(Debug, Error)]
pub enum CiStatusError {
    /// The status request did not complete in time
    #[error("CI status request timed out")]
    Timeout,

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote API returned an error
    #[error("CI API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Repository URL is not served by this source
    #[error("Unsupported repository URL: {0}")]
    UnsupportedRepo(String),
}

/// Invariant violations on the run record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    /// The run is finalized and can no longer change
    #[error("Run {0} is finalized")]
    Finalized(String),

    /// No iterations remain in the retry budget
    #[error("Retry budget of {0} iterations exhausted")]
    BudgetExhausted(u32),

    /// Iteration results must be appended in order, once per iteration
    #[error("Iteration result {got} out of order (current iteration {current})")]
    IterationOutOfOrder { got: u32, current: u32 },
}

/// Invalid branch name inputs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BranchNameError {
    /// A token sanitized to nothing
    #[error("{0} name has no usable characters")]
    EmptyToken(&'static str),

    /// Resulting name does not match the required pattern
    #[error("Invalid branch name `{0}`")]
    Invalid(String),

    /// Name collides with a protected ref
    #[error("Branch name `{0}` is a protected ref")]
    Protected(String),
}

/// Errors from the run registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No run with this id
    #[error("Run not found: {0}")]
    NotFound(String),

    /// Run request was rejected
    #[error(transparent)]
    InvalidBranchName(#[from] BranchNameError),

    /// Run request was rejected for another reason
    #[error("Invalid run request: {0}")]
    InvalidRequest(String),
}
