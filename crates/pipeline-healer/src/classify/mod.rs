//! Failure classification.
//!
//! Turns raw checker output into [`Failure`] records. Location extraction is
//! toolchain specific (see [`extract`]); category assignment goes through the
//! ordered rule table in [`rules`].
//!
//! Everything here is pure: no I/O and no shared mutable state, so concurrent
//! runs can classify freely.

pub mod extract;
pub mod rules;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::run::Failure;
use extract::Entry;
pub use rules::{categorize, rules, CategoryRule};

/// File recorded when neither the output nor the hint names one.
pub const UNKNOWN_FILE: &str = "unknown";

/// Tool family that produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toolchain {
    Pytest,
    Jest,
    Flake8,
    Eslint,
    Generic,
}

impl Toolchain {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pytest => "pytest",
            Self::Jest => "jest",
            Self::Flake8 => "flake8",
            Self::Eslint => "eslint",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for Toolchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Toolchain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pytest" | "python" => Ok(Self::Pytest),
            "jest" | "vitest" => Ok(Self::Jest),
            "flake8" => Ok(Self::Flake8),
            "eslint" => Ok(Self::Eslint),
            "generic" => Ok(Self::Generic),
            other => Err(format!("unknown toolchain: {other}")),
        }
    }
}

/// Raw output of one checker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub toolchain: Toolchain,
    pub text: String,
    /// File to blame when the output names none.
    #[serde(default)]
    pub file_hint: Option<String>,
    /// Whether the checker reported failure.
    #[serde(default)]
    pub failed: bool,
    /// Working copy root, stripped from absolute paths.
    #[serde(default)]
    pub root: Option<String>,
}

impl Diagnostic {
    pub fn new(toolchain: Toolchain, text: impl Into<String>, failed: bool) -> Self {
        Self {
            toolchain,
            text: text.into(),
            file_hint: None,
            failed,
            root: None,
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.file_hint = Some(hint.into());
        self
    }

    #[must_use]
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }
}

/// Classify one diagnostic. Entries for the same file stay separate.
pub fn classify(diagnostic: &Diagnostic) -> Vec<Failure> {
    let mut entries = match diagnostic.toolchain {
        Toolchain::Pytest => extract::pytest(&diagnostic.text),
        Toolchain::Jest => extract::jest(&diagnostic.text),
        Toolchain::Flake8 => extract::flake8(&diagnostic.text),
        Toolchain::Eslint => extract::eslint(&diagnostic.text),
        Toolchain::Generic => extract::generic(&diagnostic.text),
    };
    if entries.is_empty() && diagnostic.failed {
        entries.push(Entry::fallback(&diagnostic.text));
    }

    entries
        .into_iter()
        .map(|entry| to_failure(entry, diagnostic))
        .collect()
}

/// Classify every diagnostic of one checker pass, in order.
pub fn classify_all(diagnostics: &[Diagnostic]) -> Vec<Failure> {
    diagnostics.iter().flat_map(classify).collect()
}

fn to_failure(entry: Entry, diagnostic: &Diagnostic) -> Failure {
    let file = entry
        .file
        .map(|f| relativize(&f, diagnostic.root.as_deref()))
        .filter(|f| !f.is_empty())
        .or_else(|| diagnostic.file_hint.clone())
        .unwrap_or_else(|| UNKNOWN_FILE.to_string());

    Failure {
        file,
        line: entry.line,
        category: categorize(&entry.text),
        description: entry.description,
    }
}

/// Make a path repository-relative when it lies under `root`.
pub fn relativize(path: &str, root: Option<&str>) -> String {
    let path = path.trim();
    if let Some(root) = root.map(|r| r.trim_end_matches('/')).filter(|r| !r.is_empty()) {
        if let Some(rest) = path.strip_prefix(root) {
            if let Some(rest) = rest.strip_prefix('/') {
                return rest.to_string();
            }
        }
    }
    path.strip_prefix("./").unwrap_or(path).to_string()
}
