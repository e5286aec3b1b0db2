//! Code generator backed by the Anthropic Messages API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::prompt::{PromptRenderer, NO_CONFIDENT_FIX};
use super::{CodeGenerator, FixRequest};
use crate::config::HealerConfig;
use crate::error::CodegenError;

/// Anthropic API endpoint
pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Anthropic API version
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Upper bound on the reply; whole files come back.
const MAX_TOKENS: u32 = 8192;

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

pub struct AnthropicGenerator {
    client: Client,
    api_key: Option<String>,
    api_url: String,
    model: String,
    timeout: Duration,
    prompts: PromptRenderer,
}

impl AnthropicGenerator {
    pub fn new(
        api_key: Option<String>,
        api_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            api_url: api_url.into(),
            model: model.into(),
            timeout,
            prompts: PromptRenderer::new()?,
        })
    }

    pub fn from_config(config: &HealerConfig) -> anyhow::Result<Self> {
        Self::new(
            config.anthropic_api_key.clone(),
            config.anthropic_api_url.clone(),
            config.model.clone(),
            config.codegen_timeout(),
        )
    }
}

/// Text of the first content block, or why there is none.
fn reply_text(response: AnthropicResponse) -> Result<String, CodegenError> {
    let text = response
        .content
        .into_iter()
        .next()
        .map(|c| c.text)
        .unwrap_or_default();
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == NO_CONFIDENT_FIX {
        return Err(CodegenError::NoConfidentFix);
    }
    Ok(text)
}

#[async_trait]
impl CodeGenerator for AnthropicGenerator {
    async fn propose_fix(&self, request: &FixRequest) -> Result<String, CodegenError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| CodegenError::NotConfigured("ANTHROPIC_API_KEY is not set".into()))?;

        let prompt = self.prompts.render_fix(request)?;
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            temperature: 0.0,
            messages: vec![AnthropicMessage {
                role: "user",
                content: &prompt,
            }],
        };

        debug!(
            path = %request.path,
            failures = request.failures.len(),
            model = %self.model,
            "Requesting fix"
        );

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| timeout_or_http(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AnthropicErrorResponse>(&raw)
                .map(|e| e.error.message)
                .unwrap_or(raw);
            return Err(CodegenError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| timeout_or_http(e, self.timeout))?;
        reply_text(parsed)
    }
}

fn timeout_or_http(error: reqwest::Error, timeout: Duration) -> CodegenError {
    if error.is_timeout() {
        CodegenError::Timeout {
            secs: timeout.as_secs(),
        }
    } else {
        CodegenError::Http(error)
    }
}
