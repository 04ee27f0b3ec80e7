//! Language-model service client: streaming chat, vision descriptions, embeddings.
//!
//! Speaks the OpenAI-compatible HTTP API directly with reqwest.

use crate::conversation::history::Role;
use crate::error::{LlmError, Result};
use crate::llm::manager::{LlmManager, provider_status};
use crate::memory::embedding::Embedder;

use base64::Engine as _;
use futures::{Stream, StreamExt as _};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

/// One message in a chat-completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Incremental text fragments, in arrival order.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// The chat and vision surface of the language-model service.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    /// Streaming chat completion.
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<FragmentStream>;

    /// Non-streaming, vision-augmented completion: prompt plus image in, text out.
    async fn describe_image(&self, prompt: &str, image: &[u8], mime_type: &str) -> Result<String>;
}

/// OpenAI-compatible chat and vision model.
pub struct OpenAiModel {
    manager: Arc<LlmManager>,
}

impl OpenAiModel {
    pub fn new(manager: Arc<LlmManager>) -> Self {
        Self { manager }
    }
}

fn convert_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|message| {
            serde_json::json!({
                "role": message.role.to_string(),
                "content": message.content,
            })
        })
        .collect()
}

#[async_trait::async_trait]
impl LanguageModel for OpenAiModel {
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<FragmentStream> {
        let config = self.manager.config();
        let body = serde_json::json!({
            "model": config.chat_model,
            "messages": convert_messages(&messages),
            "max_tokens": config.max_tokens,
            "stream": true,
        });

        let response = self
            .manager
            .post("/v1/chat/completions")?
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ProviderRequest(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let error = provider_status(status, &text);
            tracing::warn!(%error, model = %config.chat_model, "chat completion rejected");
            return Err(error.into());
        }

        tracing::debug!(
            model = %config.chat_model,
            messages = messages.len(),
            "chat completion streaming"
        );

        let mut bytes = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| LlmError::ProviderRequest(e.to_string()))?;
                buffer.extend_from_slice(&chunk);
                while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(line.trim())? {
                        SseLine::Fragment(text) => yield text,
                        SseLine::Done => break 'read,
                        SseLine::Skip => {}
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn describe_image(&self, prompt: &str, image: &[u8], mime_type: &str) -> Result<String> {
        let config = self.manager.config();
        let data_url = format!(
            "data:{mime_type};base64,{}",
            base64::engine::general_purpose::STANDARD.encode(image)
        );
        let body = serde_json::json!({
            "model": config.vision_model,
            "max_tokens": config.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ],
            }],
        });

        let response = self
            .manager
            .post_json_with_retries("/v1/chat/completions", &body)
            .await?;
        parse_completion_text(&response)
    }
}

/// One parsed server-sent-events line from a streaming completion.
#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Fragment(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }

    let event: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| LlmError::MalformedResponse(format!("invalid stream event: {e}")))?;

    if let Some(message) = event["error"]["message"].as_str() {
        return Err(LlmError::CompletionFailed(message.to_string()).into());
    }

    match event["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => Ok(SseLine::Fragment(text.to_string())),
        _ => Ok(SseLine::Skip),
    }
}

fn parse_completion_text(body: &serde_json::Value) -> Result<String> {
    let message = &body["choices"][0]["message"];
    let text = message["content"]
        .as_str()
        .filter(|t| !t.trim().is_empty())
        // some reasoning models put the answer in a separate field
        .or_else(|| message["reasoning_content"].as_str())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    text.ok_or_else(|| LlmError::MalformedResponse("empty completion".into()).into())
}

/// Embeddings via the provider's `/v1/embeddings` endpoint.
pub struct RemoteEmbedder {
    manager: Arc<LlmManager>,
}

impl RemoteEmbedder {
    pub fn new(manager: Arc<LlmManager>) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.manager.config().embedding_model,
            "input": text,
        });
        let response = self
            .manager
            .post_json_with_retries("/v1/embeddings", &body)
            .await?;
        parse_embedding(&response)
    }
}

fn parse_embedding(body: &serde_json::Value) -> Result<Vec<f32>> {
    let values = body["data"][0]["embedding"]
        .as_array()
        .ok_or_else(|| LlmError::EmbeddingFailed("response has no embedding".into()))?;

    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| LlmError::EmbeddingFailed("non-numeric embedding value".into()).into())
        })
        .collect()
}
