use crate::decoder::ChatFrame;
use crate::idempotency::resolve_key;
use crate::types::{ChatMessage, ToolCall};

/// Rebuilds the in-progress agent message from decoded frames.
///
/// Tool-call batches may repeat or arrive as progressively richer snapshots; calls
/// are merged by idempotency key and the latest snapshot of each call wins.
pub struct ChatStreamAssembler {
    message: ChatMessage,
    keep_alives: usize,
}

impl ChatStreamAssembler {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            message: ChatMessage::agent(agent_name),
            keep_alives: 0,
        }
    }

    /// Returns whether the visible message changed.
    pub fn apply(&mut self, frame: ChatFrame) -> bool {
        match frame {
            ChatFrame::Text(text) => {
                if text.is_empty() {
                    return false;
                }
                self.message.content.push_str(&text);
                true
            }
            ChatFrame::ToolCalls(calls) => self.merge_tool_calls(calls),
            ChatFrame::KeepAlive => {
                self.keep_alives += 1;
                false
            }
        }
    }

    fn merge_tool_calls(&mut self, incoming: Vec<ToolCall>) -> bool {
        let existing = self.message.tool_calls.get_or_insert_with(Vec::new);
        let mut changed = false;
        for call in incoming {
            let key = resolve_key(&call);
            match existing.iter_mut().find(|c| resolve_key(c) == key) {
                Some(slot) => {
                    if *slot != call {
                        *slot = call;
                        changed = true;
                    }
                }
                None => {
                    existing.push(call);
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn message(&self) -> &ChatMessage {
        &self.message
    }

    pub fn keep_alives(&self) -> usize {
        self.keep_alives
    }

    pub fn finish(mut self) -> ChatMessage {
        self.message.is_complete = true;
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keyed(name: &str, key: &str, result: serde_json::Value) -> ToolCall {
        ToolCall {
            name: name.into(),
            result,
            idempotency_key: Some(key.into()),
            ..ToolCall::default()
        }
    }

    #[test]
    fn test_text_accumulates_and_keep_alive_is_invisible() {
        let mut asm = ChatStreamAssembler::new("helper");
        assert!(asm.apply(ChatFrame::Text("Hel".into())));
        assert!(!asm.apply(ChatFrame::KeepAlive));
        assert!(asm.apply(ChatFrame::Text("lo".into())));
        assert_eq!(asm.message().content, "Hello");
        assert_eq!(asm.keep_alives(), 1);
        assert!(!asm.message().is_complete);
        assert!(asm.finish().is_complete);
    }

    #[test]
    fn test_tool_call_snapshots_merge_by_key() {
        let mut asm = ChatStreamAssembler::new("helper");
        assert!(asm.apply(ChatFrame::ToolCalls(vec![keyed("a", "k1", json!(null))])));
        assert!(!asm.apply(ChatFrame::ToolCalls(vec![keyed("a", "k1", json!(null))])));
        assert!(asm.apply(ChatFrame::ToolCalls(vec![
            keyed("a", "k1", json!({"status": "done"})),
            keyed("b", "k2", json!(null)),
        ])));

        let calls = asm.message().tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].result, json!({"status": "done"}));
        assert_eq!(calls[1].name, "b");
    }
}
