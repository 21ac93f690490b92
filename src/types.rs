use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::constants::USER_SENDER;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConversationId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageHash(pub String);

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl ConversationId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 12)
    }
}

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// --- CONVERSATION MODEL ---

/// One turn half in a conversation. Frozen once `is_complete` is set, except for
/// the tool-call list which keeps accruing while the agent response streams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    /// `USER` for the human, otherwise the agent name.
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: USER_SENDER.to_string(),
            content: content.into(),
            is_complete: true,
            tool_calls: None,
            attachments: if attachments.is_empty() {
                None
            } else {
                Some(attachments)
            },
            created_at: Utc::now(),
        }
    }

    /// An empty, still-streaming agent message.
    pub fn agent(sender: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            content: String::new(),
            is_complete: false,
            tool_calls: None,
            attachments: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_from_user(&self) -> bool {
        self.sender == USER_SENDER
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match &self.tool_calls {
            Some(calls) => calls,
            None => &[],
        }
    }
}

/// One invocation of a named capability during generation.
///
/// `arguments` and `result` are polymorphic on the wire (raw string or object);
/// use [`crate::idempotency::parse_tool_call_result`] before inspecting `result`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub raw_tool_call: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_at: Some(Utc::now()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum AgentsError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent {0} has been deleted")]
    AgentDeleted(String),

    #[error("Agent {0} requires the disclaimer to be accepted first")]
    DisclaimerRequired(String),

    #[error("Chat stream was cancelled")]
    StreamCancelled,

    #[error("Model error: {0}")]
    Model(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl AgentsError {
    /// Status code and `type` tag of the JSON error body.
    pub fn status_and_type(&self) -> (axum::http::StatusCode, &'static str) {
        use axum::http::StatusCode;
        match self {
            AgentsError::AgentDeleted(_) => (StatusCode::GONE, "agent_deleted"),
            AgentsError::DisclaimerRequired(_) => {
                (StatusCode::FORBIDDEN, "meta_disclaimer_required")
            }
            AgentsError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            AgentsError::Serialization(_) => (StatusCode::BAD_REQUEST, "serialization_error"),
            AgentsError::AgentNotFound(_) => (StatusCode::NOT_FOUND, "agent_not_found"),
            AgentsError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            AgentsError::Network(_) => (StatusCode::BAD_GATEWAY, "network_error"),
            AgentsError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
            AgentsError::StreamCancelled => (StatusCode::INTERNAL_SERVER_ERROR, "stream_cancelled"),
            AgentsError::Model(_) => (StatusCode::BAD_GATEWAY, "model_error"),
            AgentsError::Internal(_, _) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_type) = self.inner.status_and_type();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::info!("Request rejected ({}): {}", error_type, self.inner);
        }
        (
            status,
            axum::Json(serde_json::json!({
                "error": {
                    "message": self.inner.to_string(),
                    "type": error_type,
                }
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: AgentsError,
    pub span_trace: SpanTrace,
}

impl ObservedError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self.inner, AgentsError::StreamCancelled)
    }
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<AgentsError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
