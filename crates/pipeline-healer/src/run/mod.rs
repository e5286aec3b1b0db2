//! Run record, branch naming and scoring.

pub mod branch;
pub mod score;
pub mod types;

pub use branch::{is_protected_ref, BranchName, PROTECTED_REFS};
pub use score::ScoreBreakdown;
pub use types::{
    Category, Failure, FailureReason, FinalStatus, Fix, FixOutcome, IterationResult, Run,
    RunConfig, RunId, RunOutcome, Stage, Verdict, VerificationMode,
};
