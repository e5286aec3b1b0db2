//! External collaborators of the healing engine.
//!
//! The engine only talks to the outside world through the traits defined here:
//!
//! - [`SourceDiscovery`] enumerates source and test files
//! - [`CheckRunner`] runs the project's test and lint tools
//! - [`CodeGenerator`] proposes replacement file content
//! - [`Vcs`] performs git operations on the working copy
//! - [`CiStatusSource`] reports remote CI status for a commit
//!
//! Production implementations live in the submodules; tests substitute fakes.

pub mod anthropic;
pub mod checks;
pub mod discovery;
pub mod git;
pub mod github;
pub mod prompt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::classify::Diagnostic;
use crate::config::HealerConfig;
use crate::error::{CheckError, CiStatusError, CodegenError, SetupError, VcsError};
use crate::run::Failure;
use crate::verify::{Clock, SystemClock};

pub use anthropic::AnthropicGenerator;
pub use checks::ToolchainRunner;
pub use discovery::FileDiscovery;
pub use git::GitCli;
pub use github::GitHubActions;

// =============================================================================
// Discovery
// =============================================================================

/// Repository-relative source files, with the subset recognized as tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub source_files: Vec<String>,
    pub test_files: Vec<String>,
}

#[async_trait]
pub trait SourceDiscovery: Send + Sync {
    async fn discover(&self, root: &Path) -> Result<Inventory, SetupError>;
}

// =============================================================================
// Checks
// =============================================================================

#[async_trait]
pub trait CheckRunner: Send + Sync {
    /// Run every configured checker; one diagnostic per checker invocation.
    async fn run_checks(
        &self,
        workdir: &Path,
        inventory: &Inventory,
    ) -> Result<Vec<Diagnostic>, CheckError>;
}

// =============================================================================
// Code generation
// =============================================================================

/// Everything the generator sees for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixRequest {
    pub path: String,
    pub content: String,
    pub failures: Vec<Failure>,
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Complete replacement content for `request.path`, possibly fenced.
    async fn propose_fix(&self, request: &FixRequest) -> Result<String, CodegenError>;
}

// =============================================================================
// Version control
// =============================================================================

#[async_trait]
pub trait Vcs: Send + Sync {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), VcsError>;

    /// Commit id a ref resolves to, `None` when it does not exist.
    async fn resolve_ref(&self, workdir: &Path, name: &str) -> Result<Option<String>, VcsError>;

    async fn current_branch(&self, workdir: &Path) -> Result<String, VcsError>;

    /// Create `name` at `start_point` and switch to it.
    async fn create_branch(
        &self,
        workdir: &Path,
        name: &str,
        start_point: &str,
    ) -> Result<(), VcsError>;

    async fn checkout(&self, workdir: &Path, name: &str) -> Result<(), VcsError>;

    /// Whether the working copy differs from HEAD, untracked files included.
    async fn has_changes(&self, workdir: &Path) -> Result<bool, VcsError>;

    /// Stage everything and commit; returns the new commit id.
    async fn commit_all(&self, workdir: &Path, message: &str) -> Result<String, VcsError>;

    /// Force-push `branch` to origin.
    async fn push(&self, workdir: &Path, branch: &str) -> Result<(), VcsError>;

    async fn head(&self, workdir: &Path) -> Result<String, VcsError>;
}

// =============================================================================
// Remote CI
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiConclusion {
    Success,
    Failure,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiStatus {
    Running,
    Completed(CiConclusion),
}

/// What to ask CI about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiTarget {
    pub repo_url: String,
    pub branch: String,
    pub commit: String,
}

#[async_trait]
pub trait CiStatusSource: Send + Sync {
    /// Whether this source can report on the repository.
    fn supports(&self, repo_url: &str) -> bool;

    async fn status(&self, target: &CiTarget) -> Result<CiStatus, CiStatusError>;
}

// =============================================================================
// Bundle
// =============================================================================

/// The full set of collaborators a run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub vcs: Arc<dyn Vcs>,
    pub discovery: Arc<dyn SourceDiscovery>,
    pub checks: Arc<dyn CheckRunner>,
    pub codegen: Arc<dyn CodeGenerator>,
    pub ci: Option<Arc<dyn CiStatusSource>>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Production collaborators built from configuration.
    pub fn from_config(config: &HealerConfig) -> anyhow::Result<Self> {
        let ci: Option<Arc<dyn CiStatusSource>> = match config.github_token.as_deref() {
            Some(token) if !token.is_empty() => Some(Arc::new(GitHubActions::new(
                token,
                &config.github_api_url,
                config.ci_request_timeout(),
            )?)),
            _ => None,
        };

        Ok(Self {
            vcs: Arc::new(GitCli::from_config(config)),
            discovery: Arc::new(FileDiscovery::new()),
            checks: Arc::new(ToolchainRunner::new(config.checker_timeout())),
            codegen: Arc::new(AnthropicGenerator::from_config(config)?),
            ci,
            clock: Arc::new(SystemClock),
        })
    }
}
