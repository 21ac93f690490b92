use serde::Deserialize;
use serde_json::Value;

use crate::constants::DEFAULT_USER_MESSAGE;
use crate::types::*;

/// Body of `POST /agents/:agent_name/api/chat`.
#[derive(Deserialize, Debug, Default)]
pub struct ChatRequestBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub thread: Vec<ChatMessage>,
    /// Loosely typed on the wire, see [`normalize_attachments`].
    #[serde(default)]
    pub attachments: Value,
    #[serde(default)]
    pub parameters: Value,
}

impl ChatRequestBody {
    /// An empty body counts as `{}`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The user text for this turn; blank or missing falls back to a filler prompt.
    pub fn user_message(&self) -> String {
        match &self.message {
            Some(m) if !m.trim().is_empty() => m.clone(),
            _ => DEFAULT_USER_MESSAGE.to_string(),
        }
    }
}

/// Accepts an array of attachment objects (`url` required) or bare URL strings.
/// Anything else is dropped.
pub fn normalize_attachments(raw: &Value) -> Vec<Attachment> {
    let items = match raw {
        Value::Array(items) => items,
        Value::Null => return Vec::new(),
        other => {
            tracing::debug!("Ignoring non-array attachments: {}", other);
            return Vec::new();
        }
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::String(url) if !url.trim().is_empty() => Some(Attachment {
                name: None,
                url: url.trim().to_string(),
                content_type: None,
            }),
            Value::Object(obj) => {
                let text = |key: &str| {
                    obj.get(key)
                        .and_then(|v| v.as_str())
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                };
                match text("url") {
                    Some(url) => Some(Attachment {
                        name: text("name"),
                        url,
                        content_type: text("contentType").or_else(|| text("type")),
                    }),
                    None => {
                        tracing::debug!("Dropping attachment without url");
                        None
                    }
                }
            }
            other => {
                tracing::debug!("Dropping unsupported attachment: {}", other);
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatParameters {
    /// Nothing about the turn is persisted.
    pub private_mode: bool,
    /// Inline agent source; the turn runs against an ephemeral book context.
    pub book: Option<String>,
    pub conversation_id: Option<String>,
}

impl ChatParameters {
    pub fn from_value(raw: &Value) -> Self {
        let obj = match raw.as_object() {
            Some(obj) => obj,
            None => return Self::default(),
        };
        let flag = |key: &str| obj.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
        let text = |key: &str| {
            obj.get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(String::from)
        };

        Self {
            private_mode: flag("isPrivateMode") || flag("privateMode"),
            book: text("book"),
            conversation_id: text("conversationId"),
        }
    }

    pub fn is_book_context(&self) -> bool {
        self.book.is_some()
    }

    pub fn conversation_key(&self, agent_id: &str, user: Option<&UserId>) -> ConversationId {
        match &self.conversation_id {
            Some(id) => ConversationId(id.clone()),
            None => ConversationId(format!(
                "{}:{}",
                agent_id,
                user.map(|u| u.0.as_str()).unwrap_or("anonymous")
            )),
        }
    }
}
