//! Client-side decoding of the chat response body back into frames.
//!
//! Encoded text never contains a raw `\n`, so a newline always belongs to a
//! tool-call or keep-alive frame. Text is released as soon as it is safe to
//! decode; only a line start that may still turn into a tool-call frame or the
//! keep-alive token is held back until its newline arrives.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::constants::KEEP_ALIVE_TOKEN;
use crate::frames::ToolCallsFrame;
use crate::types::ToolCall;
use crate::whitespace;

/// Serialized start of every tool-call frame.
const TOOL_CALLS_PREFIX: &[u8] = b"{\"toolCalls\":";

#[derive(Debug, Clone, PartialEq)]
pub enum ChatFrame {
    Text(String),
    ToolCalls(Vec<ToolCall>),
    KeepAlive,
}

#[derive(Debug)]
pub struct ChatFrameDecoder {
    at_line_start: bool,
}

impl Default for ChatFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatFrameDecoder {
    pub fn new() -> Self {
        Self {
            at_line_start: true,
        }
    }

    fn complete_line(&mut self, line: &[u8]) -> Option<ChatFrame> {
        let was_line_start = self.at_line_start;
        self.at_line_start = true;
        if line.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(line);

        if was_line_start {
            if text == KEEP_ALIVE_TOKEN {
                return Some(ChatFrame::KeepAlive);
            }
            if text.starts_with('{') {
                match serde_json::from_str::<ToolCallsFrame>(&text) {
                    Ok(frame) => return Some(ChatFrame::ToolCalls(frame.tool_calls)),
                    Err(e) => {
                        tracing::trace!("Line is not a tool-call frame ({}), treating as text", e);
                    }
                }
            }
        }

        Some(ChatFrame::Text(whitespace::decode(&text)))
    }

    /// Must a partial line starting a new line be held back?
    fn may_become_frame(pending: &[u8]) -> bool {
        TOOL_CALLS_PREFIX.starts_with(pending)
            || pending.starts_with(TOOL_CALLS_PREFIX)
            || KEEP_ALIVE_TOKEN.as_bytes().starts_with(pending)
    }

    /// Length of the prefix of `pending` that can be decoded without cutting a
    /// UTF-8 sequence or a whitespace token in half.
    fn safe_text_len(pending: &[u8]) -> usize {
        let valid = match std::str::from_utf8(pending) {
            Ok(s) => s,
            Err(e) => {
                // Invalid (not just truncated) bytes up front: let them through lossily.
                if let (0, Some(invalid_len)) = (e.valid_up_to(), e.error_len()) {
                    return invalid_len;
                }
                match std::str::from_utf8(&pending[..e.valid_up_to()]) {
                    Ok(s) => s,
                    Err(_) => return 0,
                }
            }
        };
        match whitespace::partial_token_start(valid) {
            Some(start) => start,
            None => valid.len(),
        }
    }
}

impl Decoder for ChatFrameDecoder {
    type Item = ChatFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<ChatFrame>, Self::Error> {
        loop {
            if let Some(newline) = src.iter().position(|b| *b == b'\n') {
                let line = src.split_to(newline);
                src.advance(1);
                match self.complete_line(&line) {
                    Some(frame) => return Ok(Some(frame)),
                    None => continue,
                }
            }

            if src.is_empty() {
                return Ok(None);
            }
            if self.at_line_start && Self::may_become_frame(src) {
                return Ok(None);
            }

            let len = Self::safe_text_len(src);
            if len == 0 {
                return Ok(None);
            }
            let chunk = src.split_to(len);
            self.at_line_start = false;
            let text = String::from_utf8_lossy(&chunk);
            return Ok(Some(ChatFrame::Text(whitespace::decode(&text))));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> std::result::Result<Option<ChatFrame>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(self.complete_line(&rest))
    }
}
