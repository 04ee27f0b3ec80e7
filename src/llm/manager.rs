//! Shared HTTP client and endpoint resolution for the language-model service.

use crate::config::LlmConfig;
use crate::error::{LlmError, Result};

use anyhow::Context as _;

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Owns the provider HTTP client and credentials.
pub struct LlmManager {
    config: LlmConfig,
    http_client: reqwest::Client,
}

impl LlmManager {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .with_context(|| "failed to build HTTP client")?;

        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// Absolute URL for an API path such as `/v1/embeddings`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Authorized POST request builder for an API path.
    pub fn post(&self, path: &str) -> Result<reqwest::RequestBuilder> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::ProviderRequest("no API key configured".into()))?;

        Ok(self
            .http_client
            .post(self.endpoint(path))
            .header("authorization", format!("Bearer {api_key}"))
            .header("content-type", "application/json"))
    }

    /// POST a JSON body and return the JSON response, surfacing the provider's
    /// error message on non-success status.
    pub async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .post(path)?
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::ProviderRequest(e.to_string()))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| LlmError::ProviderRequest(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(provider_status(status, &response_text).into());
        }

        serde_json::from_str(&response_text).map_err(|e| {
            LlmError::MalformedResponse(format!(
                "response ({status}) is not valid JSON: {e}\nBody: {}",
                truncate_body(&response_text)
            ))
            .into()
        })
    }

    /// `post_json` with bounded retries and exponential backoff on transient errors.
    pub async fn post_json_with_retries(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut attempt = 0;
        loop {
            match self.post_json(path, body).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt + 1 < MAX_RETRIES && is_retriable(&error) => {
                    attempt += 1;
                    let delay_ms = RETRY_BASE_DELAY_MS * 2u64.pow(attempt - 1);
                    tracing::warn!(%error, path, attempt, delay_ms, "retriable provider error");
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Build a status error from a provider error body.
pub(crate) fn provider_status(status: reqwest::StatusCode, body: &str) -> LlmError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| truncate_body(body).to_string());
    LlmError::ProviderStatus {
        status: status.as_u16(),
        message,
    }
}

/// Rate limits, server errors and transport failures are worth retrying.
fn is_retriable(error: &crate::Error) -> bool {
    match error {
        crate::Error::Llm(LlmError::ProviderStatus { status, .. }) => {
            *status == 429 || *status >= 500
        }
        crate::Error::Llm(LlmError::ProviderRequest(_)) => true,
        _ => false,
    }
}

/// Truncate a response body for error messages to avoid dumping megabytes of HTML.
pub(crate) fn truncate_body(body: &str) -> &str {
    let limit = 500;
    if body.len() <= limit {
        return body;
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
