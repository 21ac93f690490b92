//! The model collaborator: the streaming call the orchestrator drives, and an
//! implementation for OpenAI-compatible chat completion endpoints.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::types::*;

/// Everything the model needs for one turn.
#[derive(Debug, Clone)]
pub struct ChatPrompt {
    pub agent_name: String,
    /// Agent source, or the inline book for ephemeral contexts.
    pub system: String,
    pub thread: Vec<ChatMessage>,
    pub user_message: ChatMessage,
}

/// Incremental output. `tool_calls`, when present, is the full current snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelChunk {
    pub content: String,
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ModelChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelResponse {
    pub content: String,
    pub usage: Option<Usage>,
    pub tool_calls: Vec<ToolCall>,
    /// Agent source after the turn, when the model changed what the agent knows.
    pub updated_agent_source: Option<String>,
}

pub type ChunkSender = mpsc::UnboundedSender<ModelChunk>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Streams chunks into `on_chunk` while generating. Implementations should
    /// stop early once `cancel` fires and return what they have so far.
    async fn stream_chat(
        &self,
        prompt: &ChatPrompt,
        on_chunk: ChunkSender,
        cancel: CancellationToken,
    ) -> Result<ModelResponse>;
}

/// --- WIRE TYPES ---

#[derive(Serialize, Debug)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize, Debug)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize, Debug, PartialEq)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct StreamPulse {
    #[serde(default)]
    choices: Vec<PulseChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct PulseChoice {
    #[serde(default)]
    delta: PulseDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct PulseDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct ToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize, Debug)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

fn wire_messages(prompt: &ChatPrompt) -> Vec<WireMessage> {
    let mut messages = Vec::with_capacity(prompt.thread.len() + 2);
    if !prompt.system.trim().is_empty() {
        messages.push(WireMessage {
            role: "system",
            content: prompt.system.clone(),
        });
    }
    for message in prompt.thread.iter().chain(std::iter::once(&prompt.user_message)) {
        let mut content = message.content.clone();
        if let Some(attachments) = &message.attachments {
            for attachment in attachments {
                content.push_str(&format!("\n[attachment] {}", attachment.url));
            }
        }
        messages.push(WireMessage {
            role: if message.is_from_user() { "user" } else { "assistant" },
            content,
        });
    }
    messages
}

#[derive(Debug)]
struct ToolCallBuffer {
    id: Option<String>,
    name: String,
    arguments: String,
    first_seen: chrono::DateTime<Utc>,
}

/// Folds SSE `data:` payloads into the running response.
#[derive(Debug, Default)]
struct CompletionAccumulator {
    content: String,
    tool_calls: BTreeMap<u32, ToolCallBuffer>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    done: bool,
}

impl CompletionAccumulator {
    /// Applies one SSE line and returns the chunks it produced.
    fn apply_line(&mut self, line: &str) -> Result<Vec<ModelChunk>> {
        let data = match line.strip_prefix("data:") {
            Some(d) => d.trim(),
            // Comments (`: keep-alive`), event names and blank separators.
            None => return Ok(Vec::new()),
        };
        if data == "[DONE]" {
            self.done = true;
            return Ok(Vec::new());
        }
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let pulse: StreamPulse = serde_json::from_str(data)?;
        if let Some(error) = pulse.error {
            return Err(AgentsError::Model(format!("Provider error: {}", error)).into());
        }
        if pulse.usage.is_some() {
            self.usage = pulse.usage;
        }

        let mut chunks = Vec::new();
        for choice in pulse.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    self.content.push_str(&text);
                    chunks.push(ModelChunk::text(text));
                }
            }
            if let Some(deltas) = choice.delta.tool_calls {
                if !deltas.is_empty() {
                    for delta in deltas {
                        self.apply_tool_call_delta(delta);
                    }
                    chunks.push(ModelChunk {
                        content: String::new(),
                        tool_calls: Some(self.tool_call_snapshot()),
                    });
                }
            }
        }
        Ok(chunks)
    }

    fn apply_tool_call_delta(&mut self, delta: ToolCallDelta) {
        let buffer = self
            .tool_calls
            .entry(delta.index)
            .or_insert_with(|| ToolCallBuffer {
                id: None,
                name: String::new(),
                arguments: String::new(),
                first_seen: Utc::now(),
            });
        if let Some(id) = delta.id {
            if !id.is_empty() {
                buffer.id = Some(id);
            }
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                buffer.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                buffer.arguments.push_str(&arguments);
            }
        }
    }

    fn tool_call_snapshot(&self) -> Vec<ToolCall> {
        self.tool_calls
            .iter()
            .map(|(index, buffer)| {
                // Arguments stay a raw string until the JSON is complete.
                let arguments = if buffer.arguments.is_empty() {
                    serde_json::Value::Null
                } else {
                    match serde_json::from_str(&buffer.arguments) {
                        Ok(v) => v,
                        Err(_) => serde_json::Value::String(buffer.arguments.clone()),
                    }
                };
                let mut raw = serde_json::Map::new();
                raw.insert("index".into(), (*index).into());
                if let Some(id) = &buffer.id {
                    raw.insert("id".into(), id.clone().into());
                }
                ToolCall {
                    name: buffer.name.clone(),
                    arguments,
                    result: serde_json::Value::Null,
                    raw_tool_call: serde_json::Value::Object(raw),
                    created_at: Some(buffer.first_seen),
                    idempotency_key: None,
                }
            })
            .collect()
    }

    fn into_response(self) -> ModelResponse {
        let tool_calls = self.tool_call_snapshot();
        ModelResponse {
            content: self.content,
            usage: self.usage,
            tool_calls,
            updated_agent_source: None,
        }
    }
}

pub struct OpenAiCompatibleModel {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleModel {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            model: model.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleModel {
    async fn stream_chat(
        &self,
        prompt: &ChatPrompt,
        on_chunk: ChunkSender,
        cancel: CancellationToken,
    ) -> Result<ModelResponse> {
        let api_key = match &self.api_key {
            Some(k) => k,
            None => {
                return Err(
                    AgentsError::Model("OPENROUTER_API_KEY is not configured".to_string()).into(),
                )
            }
        };

        let request = CompletionRequest {
            model: &self.model,
            messages: wire_messages(prompt),
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        tracing::info!(
            "[⚙️  -> ☁️ ] {} | {} messages | agent {}",
            self.model,
            request.messages.len(),
            prompt.agent_name
        );

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = match response.text().await {
                Ok(t) => t,
                Err(_) => "Unknown error (failed to read response text)".to_string(),
            };
            return Err(AgentsError::Model(format!("Upstream {}: {}", status, err_body)).into());
        }

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let mut lines_stream = FramedRead::new(
            tokio_util::io::StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(1024 * 1024),
        );

        let mut accumulator = CompletionAccumulator::default();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("[☁️  -> ⚙️ ] Generation cancelled, dropping upstream stream");
                    break;
                }
                line = lines_stream.next() => line,
            };
            let line = match line {
                Some(Ok(line)) => line,
                Some(Err(tokio_util::codec::LinesCodecError::Io(e))) => return Err(e.into()),
                Some(Err(tokio_util::codec::LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(AgentsError::Model("SSE line too long".to_string()).into())
                }
                None => break,
            };

            for chunk in accumulator.apply_line(&line)? {
                if on_chunk.send(chunk).is_err() {
                    tracing::trace!("Chunk receiver gone");
                }
            }
            if accumulator.done {
                break;
            }
        }

        tracing::info!(
            "[☁️  -> ⚙️ ] Generation finished ({}) | {} chars | {} tool calls",
            accumulator.finish_reason.as_deref().unwrap_or("no finish reason"),
            accumulator.content.len(),
            accumulator.tool_calls.len()
        );
        Ok(accumulator.into_response())
    }
}
