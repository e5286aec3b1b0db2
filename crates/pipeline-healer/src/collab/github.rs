//! GitHub Actions as a remote CI status source.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{CiConclusion, CiStatus, CiStatusSource, CiTarget};
use crate::error::CiStatusError;

/// Workflow runs fetched per poll; only the latest one decides.
const RUNS_PER_PAGE: u32 = 5;

#[derive(Debug, Deserialize)]
struct WorkflowRunsResponse {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

/// Owner and repository name from a GitHub URL.
pub fn parse_repo(url: &str) -> Option<(String, String)> {
    let trimmed = url.trim().trim_end_matches('/');
    let path = trimmed
        .strip_prefix("https://github.com/")
        .or_else(|| trimmed.strip_prefix("http://github.com/"))
        .or_else(|| trimmed.strip_prefix("git@github.com:"))?;
    let mut parts = path.split('/');
    let owner = parts.next().filter(|s| !s.is_empty())?;
    let repo = parts
        .next()
        .map(|r| r.trim_end_matches(".git"))
        .filter(|s| !s.is_empty())?;
    Some((owner.to_string(), repo.to_string()))
}

/// Status implied by the most recent workflow run.
pub fn status_from_runs(runs: &[WorkflowRun]) -> CiStatus {
    let Some(latest) = runs.first() else {
        return CiStatus::Running;
    };
    if latest.status != "completed" {
        return CiStatus::Running;
    }
    match latest.conclusion.as_deref() {
        Some("success") => CiStatus::Completed(CiConclusion::Success),
        Some("cancelled") => CiStatus::Completed(CiConclusion::Cancelled),
        _ => CiStatus::Completed(CiConclusion::Failure),
    }
}

pub struct GitHubActions {
    client: Client,
    api_url: String,
}

impl GitHubActions {
    pub fn new(token: &str, api_url: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("pipeline-healer"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))?,
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CiStatusSource for GitHubActions {
    fn supports(&self, repo_url: &str) -> bool {
        parse_repo(repo_url).is_some()
    }

    async fn status(&self, target: &CiTarget) -> Result<CiStatus, CiStatusError> {
        let (owner, repo) = parse_repo(&target.repo_url)
            .ok_or_else(|| CiStatusError::UnsupportedRepo(target.repo_url.clone()))?;
        let url = format!("{}/repos/{owner}/{repo}/actions/runs", self.api_url);

        let per_page = RUNS_PER_PAGE.to_string();
        let mut query = vec![("branch", target.branch.as_str()), ("per_page", per_page.as_str())];
        if !target.commit.is_empty() {
            query.push(("head_sha", target.commit.as_str()));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(timeout_or_http)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(%owner, %repo, "Actions runs not found yet");
            return Ok(CiStatus::Running);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CiStatusError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: WorkflowRunsResponse = response.json().await.map_err(timeout_or_http)?;
        let ci_status = status_from_runs(&body.workflow_runs);
        debug!(
            %owner,
            %repo,
            branch = %target.branch,
            runs = body.workflow_runs.len(),
            status = ?ci_status,
            "Polled GitHub Actions"
        );
        Ok(ci_status)
    }
}

fn timeout_or_http(error: reqwest::Error) -> CiStatusError {
    if error.is_timeout() {
        CiStatusError::Timeout
    } else {
        CiStatusError::Http(error)
    }
}
