//! Conversation history recorder.
//!
//! Every persisted message stores the hash of its predecessor, so each
//! conversation forms an append-only chain that can be re-verified later.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;

use crate::db::DbPool;
use crate::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn of(message: &ChatMessage) -> Self {
        if message.is_from_user() {
            MessageRole::User
        } else {
            MessageRole::Assistant
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecordRequest<'a> {
    pub conversation_id: &'a ConversationId,
    pub message: &'a ChatMessage,
    pub previous_message_hash: Option<&'a MessageHash>,
    pub usage: Option<&'a Usage>,
    /// False in private mode: the call must succeed without storing anything.
    pub enabled: bool,
}

#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    /// Returns the new message hash, or `None` when recording is disabled.
    async fn record(&self, request: RecordRequest<'_>) -> Result<Option<MessageHash>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message: ChatMessage,
    pub role: MessageRole,
    pub previous_hash: Option<MessageHash>,
    pub hash: MessageHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    pub checked: usize,
    /// Id of the first message whose hash or predecessor does not check out.
    pub first_invalid: Option<String>,
}

impl ChainVerification {
    pub fn is_valid(&self) -> bool {
        self.first_invalid.is_none()
    }
}

/// Fields covered by a message hash, in their stored text form.
struct HashInput<'a> {
    previous_hash: Option<&'a str>,
    conversation_id: &'a str,
    role: &'a str,
    sender: &'a str,
    content: &'a str,
    tool_calls: Option<&'a str>,
    created_at: &'a str,
}

impl HashInput<'_> {
    fn digest(&self) -> MessageHash {
        let mut hasher = Sha256::new();
        for field in [
            self.previous_hash.unwrap_or(""),
            self.conversation_id,
            self.role,
            self.sender,
            self.content,
            self.tool_calls.unwrap_or(""),
            self.created_at,
        ] {
            // Length prefix keeps field boundaries unambiguous.
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        let hex: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        MessageHash(hex)
    }
}

pub struct SqliteHistoryRecorder {
    pool: DbPool,
}

impl SqliteHistoryRecorder {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, role, sender, content, tool_calls, attachments, previous_hash, hash, created_at
             FROM chat_messages WHERE conversation_id = ? ORDER BY seq ASC",
        )
        .bind(&conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let role: String = row.try_get("role")?;
            let tool_calls: Option<String> = row.try_get("tool_calls")?;
            let attachments: Option<String> = row.try_get("attachments")?;
            let created_at: String = row.try_get("created_at")?;
            let previous_hash: Option<String> = row.try_get("previous_hash")?;

            let created_at = match DateTime::parse_from_rfc3339(&created_at) {
                Ok(t) => t.with_timezone(&Utc),
                Err(e) => {
                    return Err(AgentsError::Internal(
                        format!("Corrupt created_at '{}': {}", created_at, e),
                        tracing_error::SpanTrace::capture(),
                    )
                    .into())
                }
            };

            messages.push(StoredMessage {
                message: ChatMessage {
                    id: row.try_get("id")?,
                    sender: row.try_get("sender")?,
                    content: row.try_get("content")?,
                    is_complete: true,
                    tool_calls: match tool_calls {
                        Some(json) => Some(serde_json::from_str(&json)?),
                        None => None,
                    },
                    attachments: match attachments {
                        Some(json) => Some(serde_json::from_str(&json)?),
                        None => None,
                    },
                    created_at,
                },
                role: if role == MessageRole::User.as_str() {
                    MessageRole::User
                } else {
                    MessageRole::Assistant
                },
                previous_hash: previous_hash.map(MessageHash),
                hash: MessageHash(row.try_get("hash")?),
            });
        }
        Ok(messages)
    }

    /// Recomputes every hash of the conversation and checks that each predecessor
    /// hash points at an earlier message of the same conversation.
    pub async fn verify_chain(&self, conversation_id: &ConversationId) -> Result<ChainVerification> {
        let rows = sqlx::query(
            "SELECT id, role, sender, content, tool_calls, previous_hash, hash, created_at
             FROM chat_messages WHERE conversation_id = ? ORDER BY seq ASC",
        )
        .bind(&conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut seen_hashes = std::collections::HashSet::new();
        let mut checked = 0;
        for row in rows {
            let id: String = row.try_get("id")?;
            let role: String = row.try_get("role")?;
            let sender: String = row.try_get("sender")?;
            let content: String = row.try_get("content")?;
            let tool_calls: Option<String> = row.try_get("tool_calls")?;
            let previous_hash: Option<String> = row.try_get("previous_hash")?;
            let hash: String = row.try_get("hash")?;
            let created_at: String = row.try_get("created_at")?;

            let expected = HashInput {
                previous_hash: previous_hash.as_deref(),
                conversation_id: &conversation_id.0,
                role: &role,
                sender: &sender,
                content: &content,
                tool_calls: tool_calls.as_deref(),
                created_at: &created_at,
            }
            .digest();

            let predecessor_ok = match &previous_hash {
                Some(p) => seen_hashes.contains(p),
                None => true,
            };
            if expected.0 != hash || !predecessor_ok {
                tracing::warn!(
                    "Hash chain broken in conversation {} at message {}",
                    conversation_id.short(),
                    id
                );
                return Ok(ChainVerification {
                    checked,
                    first_invalid: Some(id),
                });
            }
            seen_hashes.insert(hash);
            checked += 1;
        }

        Ok(ChainVerification {
            checked,
            first_invalid: None,
        })
    }
}

#[async_trait]
impl HistoryRecorder for SqliteHistoryRecorder {
    async fn record(&self, request: RecordRequest<'_>) -> Result<Option<MessageHash>> {
        if !request.enabled {
            tracing::debug!("Recording disabled, skipping {} message", MessageRole::of(request.message).as_str());
            return Ok(None);
        }

        let message = request.message;
        let role = MessageRole::of(message);
        let tool_calls = match &message.tool_calls {
            Some(calls) if !calls.is_empty() => Some(serde_json::to_string(calls)?),
            _ => None,
        };
        let attachments = match &message.attachments {
            Some(a) if !a.is_empty() => Some(serde_json::to_string(a)?),
            _ => None,
        };
        let usage = match request.usage {
            Some(u) => Some(serde_json::to_string(u)?),
            None => None,
        };
        let created_at = message
            .created_at
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        let mut tx = self.pool.begin().await?;

        let previous_hash = match request.previous_message_hash {
            Some(h) => Some(h.0.clone()),
            // A user message continues the conversation from its latest message.
            None if role == MessageRole::User => sqlx::query_scalar::<_, String>(
                "SELECT hash FROM chat_messages WHERE conversation_id = ? ORDER BY seq DESC LIMIT 1",
            )
            .bind(&request.conversation_id.0)
            .fetch_optional(&mut *tx)
            .await?,
            None => None,
        };

        let hash = HashInput {
            previous_hash: previous_hash.as_deref(),
            conversation_id: &request.conversation_id.0,
            role: role.as_str(),
            sender: &message.sender,
            content: &message.content,
            tool_calls: tool_calls.as_deref(),
            created_at: &created_at,
        }
        .digest();

        sqlx::query(
            "INSERT INTO chat_messages
                (id, conversation_id, role, sender, content, tool_calls, attachments, usage, previous_hash, hash, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&request.conversation_id.0)
        .bind(role.as_str())
        .bind(&message.sender)
        .bind(&message.content)
        .bind(&tool_calls)
        .bind(&attachments)
        .bind(&usage)
        .bind(&previous_hash)
        .bind(&hash.0)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            "Recorded {} message in {} ({})",
            role.as_str(),
            request.conversation_id.short(),
            crate::str_utils::prefix_chars(&hash.0, 12)
        );
        Ok(Some(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;

    async fn record_turn(
        recorder: &SqliteHistoryRecorder,
        conversation: &ConversationId,
        user_text: &str,
        reply: &str,
    ) -> (MessageHash, MessageHash) {
        let user = ChatMessage::user(user_text, Vec::new());
        let user_hash = recorder
            .record(RecordRequest {
                conversation_id: conversation,
                message: &user,
                previous_message_hash: None,
                usage: None,
                enabled: true,
            })
            .await
            .unwrap()
            .unwrap();

        let mut model = ChatMessage::agent("helper");
        model.content = reply.into();
        model.is_complete = true;
        let model_hash = recorder
            .record(RecordRequest {
                conversation_id: conversation,
                message: &model,
                previous_message_hash: Some(&user_hash),
                usage: Some(&Usage::default()),
                enabled: true,
            })
            .await
            .unwrap()
            .unwrap();
        (user_hash, model_hash)
    }

    #[tokio::test]
    async fn test_turns_form_a_verifiable_chain() {
        let recorder = SqliteHistoryRecorder::new(init_memory_db().await.unwrap());
        let conversation = ConversationId("agent-1:u1".into());

        let (user1, model1) = record_turn(&recorder, &conversation, "hi", "hello").await;
        let (_, _) = record_turn(&recorder, &conversation, "again", "sure").await;

        let stored = recorder.messages(&conversation).await.unwrap();
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[0].previous_hash, None);
        assert_eq!(stored[1].previous_hash.as_ref(), Some(&user1));
        assert_eq!(stored[2].previous_hash.as_ref(), Some(&model1));
        assert_eq!(stored[3].message.content, "sure");
        assert_eq!(stored[3].role, MessageRole::Assistant);

        let report = recorder.verify_chain(&conversation).await.unwrap();
        assert!(report.is_valid());
        assert_eq!(report.checked, 4);
    }

    #[tokio::test]
    async fn test_tampering_is_detected() {
        let pool = init_memory_db().await.unwrap();
        let recorder = SqliteHistoryRecorder::new(pool.clone());
        let conversation = ConversationId("c".into());
        record_turn(&recorder, &conversation, "hi", "hello").await;

        sqlx::query("UPDATE chat_messages SET content = 'edited' WHERE role = 'assistant'")
            .execute(&pool)
            .await
            .unwrap();

        let report = recorder.verify_chain(&conversation).await.unwrap();
        assert!(!report.is_valid());
        assert_eq!(report.checked, 1);
    }

    #[tokio::test]
    async fn test_disabled_recording_is_a_no_op() {
        let recorder = SqliteHistoryRecorder::new(init_memory_db().await.unwrap());
        let conversation = ConversationId("private".into());
        let message = ChatMessage::user("secret", Vec::new());
        let hash = recorder
            .record(RecordRequest {
                conversation_id: &conversation,
                message: &message,
                previous_message_hash: None,
                usage: None,
                enabled: false,
            })
            .await
            .unwrap();
        assert_eq!(hash, None);
        assert!(recorder.messages(&conversation).await.unwrap().is_empty());
    }
}
