//! Healing branch naming and protected ref detection.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

use crate::error::BranchNameError;

/// Suffix every healing branch carries.
pub const BRANCH_SUFFIX: &str = "AI_Fix";

/// Refs the engine must never commit or push to.
pub const PROTECTED_REFS: [&str; 3] = ["main", "master", "develop"];

static BRANCH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9_]+_AI_Fix$").expect("valid regex"));

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// A validated healing branch name of the form `<TEAM>_<LEADER>_AI_Fix`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BranchName(String);

impl BranchName {
    /// Build the branch name from a team name and a leader name.
    pub fn from_tokens(team: &str, leader: &str) -> Result<Self, BranchNameError> {
        let team = sanitize_token(team);
        if !has_usable_chars(&team) {
            return Err(BranchNameError::EmptyToken("Team"));
        }
        let leader = sanitize_token(leader);
        if !has_usable_chars(&leader) {
            return Err(BranchNameError::EmptyToken("Leader"));
        }
        Self::parse(&format!("{team}_{leader}_{BRANCH_SUFFIX}"))
    }

    /// Validate an existing branch name.
    pub fn parse(name: &str) -> Result<Self, BranchNameError> {
        if is_protected_ref(name) {
            return Err(BranchNameError::Protected(name.to_string()));
        }
        if !BRANCH_PATTERN.is_match(name) {
            return Err(BranchNameError::Invalid(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BranchName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Trim, uppercase, collapse whitespace runs to `_`, drop anything outside `[A-Z0-9_]`.
pub fn sanitize_token(token: &str) -> String {
    let upper = token.trim().to_uppercase();
    WHITESPACE_RUN
        .replace_all(&upper, "_")
        .chars()
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_')
        .collect()
}

/// A token made only of separators names nobody.
fn has_usable_chars(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_alphanumeric())
}

/// Whether a ref name (local, remote-tracking or fully qualified) is protected.
pub fn is_protected_ref(name: &str) -> bool {
    let short = name
        .trim()
        .trim_start_matches("refs/heads/")
        .trim_start_matches("refs/remotes/")
        .trim_start_matches("origin/");
    PROTECTED_REFS.iter().any(|p| p.eq_ignore_ascii_case(short))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_tokens() {
        let name = BranchName::from_tokens("rift organisers", "saiyam kumar").unwrap();
        assert_eq!(name.as_str(), "RIFT_ORGANISERS_SAIYAM_KUMAR_AI_Fix");
    }

    #[test]
    fn test_whitespace_runs_and_symbols() {
        assert_eq!(sanitize_token("team  \t alpha"), "TEAM_ALPHA");
        assert_eq!(sanitize_token("o'brien-smith!"), "OBRIENSMITH");
        assert_eq!(sanitize_token("Team 42"), "TEAM_42");
    }

    #[test]
    fn test_generated_names_match_pattern() {
        for (team, leader) in [("a", "b"), ("Code Crafters", "J. Doe"), ("x1", "y 2 z")] {
            let name = BranchName::from_tokens(team, leader).unwrap();
            assert!(BRANCH_PATTERN.is_match(name.as_str()), "{name}");
        }
    }

    #[test]
    fn test_empty_tokens_rejected() {
        assert_eq!(
            BranchName::from_tokens("!!!", "leader"),
            Err(BranchNameError::EmptyToken("Team"))
        );
        assert_eq!(
            BranchName::from_tokens("team", "   "),
            Err(BranchNameError::EmptyToken("Leader"))
        );
    }

    #[test]
    fn test_separator_only_tokens_rejected() {
        for blank in [" - ", "___", "\t\n", " _ - _ "] {
            assert_eq!(
                BranchName::from_tokens(blank, "leader"),
                Err(BranchNameError::EmptyToken("Team")),
                "{blank:?}"
            );
        }
    }

    #[test]
    fn test_surrounding_whitespace_trimmed() {
        let name = BranchName::from_tokens("  code crafters ", "\tjane ").unwrap();
        assert_eq!(name.as_str(), "CODE_CRAFTERS_JANE_AI_Fix");
        assert_eq!(sanitize_token(" a - b "), "A__B");
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        assert!(BranchName::parse("main").is_err());
        assert!(BranchName::parse("team_lead_ai_fix").is_err());
        assert!(BranchName::parse("TEAM_LEAD_AI_Fix").is_ok());
    }

    #[test]
    fn test_protected_refs() {
        assert!(is_protected_ref("main"));
        assert!(is_protected_ref("origin/master"));
        assert!(is_protected_ref("refs/heads/develop"));
        assert!(is_protected_ref("MAIN"));
        assert!(!is_protected_ref("maintenance"));
        assert!(!is_protected_ref("TEAM_LEAD_AI_Fix"));
    }
}
