//! Engine configuration.
//!
//! Loaded from an optional JSON file, then overridden by environment
//! variables. Every field has a default so an empty file (or no file) works.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::run::types::{
    DEFAULT_CI_POLL_INTERVAL_SECS, DEFAULT_CI_TIMEOUT_SECS, DEFAULT_RETRY_BUDGET,
};

pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealerConfig {
    /// GitHub token for pushing and for reading Actions status.
    #[serde(skip_serializing)]
    pub github_token: Option<String>,

    #[serde(skip_serializing)]
    pub anthropic_api_key: Option<String>,

    /// Model used for fix generation.
    pub model: String,

    pub github_api_url: String,
    pub anthropic_api_url: String,

    pub retry_budget: u32,
    pub ci_poll_interval_secs: u64,
    pub ci_timeout_secs: u64,
    /// Bound on a single CI status request.
    pub ci_request_timeout_secs: u64,
    pub codegen_timeout_secs: u64,
    /// Bound on a single checker command.
    pub checker_timeout_secs: u64,

    pub repos_dir: PathBuf,
    pub results_dir: PathBuf,

    pub git_user_name: String,
    pub git_user_email: String,

    /// Address the HTTP API listens on.
    pub listen_addr: String,
    /// Extra allowed CORS origin for the dashboard.
    pub frontend_url: Option<String>,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            github_token: None,
            anthropic_api_key: None,
            model: DEFAULT_MODEL.to_string(),
            github_api_url: DEFAULT_GITHUB_API_URL.to_string(),
            anthropic_api_url: crate::collab::anthropic::ANTHROPIC_API_URL.to_string(),
            retry_budget: DEFAULT_RETRY_BUDGET,
            ci_poll_interval_secs: DEFAULT_CI_POLL_INTERVAL_SECS,
            ci_timeout_secs: DEFAULT_CI_TIMEOUT_SECS,
            ci_request_timeout_secs: 30,
            codegen_timeout_secs: 120,
            checker_timeout_secs: 180,
            repos_dir: PathBuf::from("/tmp/repos"),
            results_dir: PathBuf::from("/tmp/results"),
            git_user_name: "AI-AGENT".to_string(),
            git_user_email: "ai-agent@cicd-healer.dev".to_string(),
            listen_addr: "0.0.0.0:8000".to_string(),
            frontend_url: None,
        }
    }
}

impl HealerConfig {
    /// Load from `path` (if given), apply environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                serde_json::from_str(&content).context("Failed to parse config file")?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make every run fail or spin.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.retry_budget >= 1,
            "retry_budget (MAX_ITERATIONS) must be at least 1"
        );
        ensure!(
            self.ci_poll_interval_secs >= 1,
            "ci_poll_interval_secs (CICD_POLL_INTERVAL) must be at least 1"
        );
        Ok(())
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("GITHUB_TOKEN") {
            self.github_token = Some(v);
        }
        if let Some(v) = get("ANTHROPIC_API_KEY") {
            self.anthropic_api_key = Some(v);
        }
        if let Some(v) = get("HEALER_MODEL") {
            self.model = v;
        }
        if let Some(v) = get("CICD_POLL_INTERVAL") {
            self.ci_poll_interval_secs = parse_env("CICD_POLL_INTERVAL", &v)?;
        }
        if let Some(v) = get("CICD_MAX_WAIT") {
            self.ci_timeout_secs = parse_env("CICD_MAX_WAIT", &v)?;
        }
        if let Some(v) = get("MAX_ITERATIONS") {
            self.retry_budget = parse_env("MAX_ITERATIONS", &v)?;
        }
        if let Some(v) = get("SANDBOX_TIMEOUT") {
            self.checker_timeout_secs = parse_env("SANDBOX_TIMEOUT", &v)?;
        }
        if let Some(v) = get("REPOS_DIR") {
            self.repos_dir = PathBuf::from(v);
        }
        if let Some(v) = get("RESULTS_DIR") {
            self.results_dir = PathBuf::from(v);
        }
        if let Some(v) = get("GIT_USER_NAME") {
            self.git_user_name = v;
        }
        if let Some(v) = get("GIT_USER_EMAIL") {
            self.git_user_email = v;
        }
        if let Some(v) = get("PORT") {
            let port: u16 = parse_env("PORT", &v)?;
            self.listen_addr = format!("0.0.0.0:{port}");
        }
        if let Some(v) = get("FRONTEND_URL") {
            self.frontend_url = Some(v);
        }
        Ok(())
    }

    pub fn ci_poll_interval(&self) -> Duration {
        Duration::from_secs(self.ci_poll_interval_secs)
    }

    pub fn ci_timeout(&self) -> Duration {
        Duration::from_secs(self.ci_timeout_secs)
    }

    pub fn ci_request_timeout(&self) -> Duration {
        Duration::from_secs(self.ci_request_timeout_secs)
    }

    pub fn codegen_timeout(&self) -> Duration {
        Duration::from_secs(self.codegen_timeout_secs)
    }

    pub fn checker_timeout(&self) -> Duration {
        Duration::from_secs(self.checker_timeout_secs)
    }

    pub fn has_github_token(&self) -> bool {
        self.github_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {key}: {value}"))
}
