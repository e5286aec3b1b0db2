//! Self-healing CI pipeline engine.
//!
//! Given a repository URL, a team name and a leader name, a run clones the
//! repository into an isolated working copy, runs its tests and linters,
//! classifies each failure, asks a code generator for replacement content,
//! commits the changes to a dedicated `<TEAM>_<LEADER>_AI_Fix` branch and
//! re-verifies, up to a fixed retry budget. Protected refs are never written.
//!
//! # Modules
//!
//! - [`run`]: the run record, branch naming and scoring
//! - [`classify`]: turning checker output into categorized failures
//! - [`collab`]: traits for the outside world, with production implementations
//! - [`patch`]: applying generated fixes to the working copy
//! - [`publish`]: committing and pushing on the healing branch
//! - [`verify`]: remote CI polling or local re-checks
//! - [`orchestrator`]: the stage machine that drives a run
//! - [`registry`]: live and finished runs, with progress subscriptions
//! - [`server`]: the HTTP API

pub mod classify;
pub mod collab;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod patch;
pub mod publish;
pub mod registry;
pub mod results;
pub mod run;
pub mod server;
pub mod verify;

pub use classify::{classify, classify_all, Diagnostic, Toolchain};
pub use collab::Collaborators;
pub use config::HealerConfig;
pub use events::{ProgressEvent, RunSummary};
pub use orchestrator::{Orchestrator, RunRequest};
pub use registry::{RunHandle, RunRegistry};
pub use run::{BranchName, Category, Failure, FinalStatus, Run, RunId, RunOutcome, Stage};
