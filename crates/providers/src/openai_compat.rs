//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, LM Studio, and any
//! endpoint exposing a streaming `/chat/completions`.
//!
//! Tool-call fragments are forwarded exactly as received, one
//! [`StreamChunk`] per SSE `data:` line. Reassembly happens downstream.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rosiwit_config::AppConfig;
use rosiwit_core::error::ProviderError;
use rosiwit_core::lines::LineBuffer;
use rosiwit_core::message::{Message, Role};
use rosiwit_core::provider::*;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Upper bound on a single streaming request, end to end.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// An OpenAI-compatible streaming provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Build from application config. A missing API key is an error.
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::NotConfigured(
                    "no API key; set ROSIWIT_API_KEY or OPENAI_API_KEY".into(),
                )
            })?;
        Self::new("openai", &config.base_url, api_key)
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| {
                let tool_calls: Vec<ApiToolCall> = m
                    .tool_calls
                    .iter()
                    .map(|tc| ApiToolCall {
                        id: tc.id.clone(),
                        r#type: tc.call_type.clone(),
                        function: ApiFunction {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    })
                    .collect();

                // Assistant turns that only call tools carry no text
                let content = if m.role == Role::Assistant && m.content.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(m.content.clone())
                };

                ApiMessage {
                    role: m.role.to_string(),
                    content,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    tool_call_id: m.tool_call_id.clone(),
                }
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(request.tools);
        }

        body
    }
}

/// What one SSE `data:` payload means for the chunk stream.
#[derive(Debug)]
enum DataLine {
    /// Forward this chunk and keep reading.
    Chunk(StreamChunk),
    /// The `[DONE]` sentinel: the response is complete.
    Done,
    /// Nothing to forward.
    Skip,
}

fn parse_data_line(data: &str) -> Result<DataLine, serde_json::Error> {
    if data == "[DONE]" {
        return Ok(DataLine::Done);
    }

    let response: StreamResponse = serde_json::from_str(data)?;

    // Some backends attach usage to content chunks, others send it alone
    let usage = response.usage.map(|usage| Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    });

    let (content, tool_calls) = match response.choices.into_iter().next() {
        Some(choice) => (
            choice.delta.content.filter(|c| !c.is_empty()),
            choice.delta.tool_calls.unwrap_or_default(),
        ),
        None => (None, Vec::new()),
    };

    if content.is_none() && tool_calls.is_empty() && usage.is_none() {
        return Ok(DataLine::Skip);
    }

    Ok(DataLine::Chunk(StreamChunk {
        content,
        tool_calls,
        usage,
        ..StreamChunk::default()
    }))
}

/// Read an SSE body, forwarding one chunk per `data:` line until `[DONE]`
/// or the end of the body. Always ends with a `done` chunk unless the
/// receiver went away or the body failed.
async fn forward_sse<S, B, E>(provider: &str, body: S, tx: mpsc::Sender<Result<StreamChunk, ProviderError>>)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    futures::pin_mut!(body);
    let mut lines = LineBuffer::new();

    while let Some(bytes) = body.next().await {
        let bytes = match bytes {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                    .await;
                return;
            }
        };

        for line in lines.push(bytes.as_ref()) {
            // Skip empty lines and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };

            match parse_data_line(data.trim()) {
                Ok(DataLine::Chunk(chunk)) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return; // receiver dropped
                    }
                }
                Ok(DataLine::Done) => {
                    let _ = tx.send(Ok(StreamChunk::finished())).await;
                    return;
                }
                Ok(DataLine::Skip) => {}
                Err(e) => {
                    trace!(
                        provider = %provider,
                        data = %data,
                        error = %e,
                        "Ignoring unparseable SSE chunk"
                    );
                }
            }
        }
    }

    if let Some(tail) = lines.finish() {
        trace!(provider = %provider, tail = %tail, "Discarding unterminated SSE line");
    }

    // Stream ended without [DONE]
    let _ = tx.send(Ok(StreamChunk::finished())).await;
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request);

        debug!(
            provider = %self.name,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending streaming request"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();

        if status == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_secs: 5,
            });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider streaming error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let (tx, rx) = mpsc::channel(64);
        let provider_name = self.name.clone();

        // Spawn task to read the SSE byte stream and forward chunks
        tokio::spawn(async move {
            forward_sse(&provider_name, response.bytes_stream(), tx).await;
        });

        Ok(rx)
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}
