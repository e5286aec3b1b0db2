//! Final run scoring.

use serde::{Deserialize, Serialize};

/// Score every finished run starts from.
pub const BASE_SCORE: i64 = 100;
/// Bonus for finishing strictly under [`SPEED_THRESHOLD_SECS`].
pub const SPEED_BONUS: i64 = 10;
pub const SPEED_THRESHOLD_SECS: u64 = 300;
/// Commits allowed before the efficiency penalty applies.
pub const FREE_COMMITS: u32 = 20;
pub const PENALTY_PER_COMMIT: i64 = 2;

/// Breakdown of a run's score. The penalty is stored as a positive amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base: i64,
    pub speed_bonus: i64,
    pub efficiency_penalty: i64,
    pub total: i64,
}

impl ScoreBreakdown {
    /// Compute the score for a run. Not clamped; heavy commit counts go negative.
    pub fn compute(elapsed_secs: u64, commit_count: u32) -> Self {
        let speed_bonus = if elapsed_secs < SPEED_THRESHOLD_SECS {
            SPEED_BONUS
        } else {
            0
        };
        let extra_commits = i64::from(commit_count.saturating_sub(FREE_COMMITS));
        let efficiency_penalty = PENALTY_PER_COMMIT * extra_commits;

        Self {
            base: BASE_SCORE,
            speed_bonus,
            efficiency_penalty,
            total: BASE_SCORE + speed_bonus - efficiency_penalty,
        }
    }
}
