//! Simulated streaming for text that is already fully known (agent message suffix).
//!
//! The text is cut into word-sized increments and pushed through the same text
//! path as live model output, with a short pause between increments, so the
//! client keeps seeing the usual typing cadence.

use std::time::Duration;

use crate::frames::{ChatStreamWriter, FrameSink};
use crate::types::{AgentsError, Result};

#[derive(Debug, Clone, Copy)]
pub struct EmulationCadence {
    pub delay: Duration,
    /// Random extra delay, up to this much, added per increment.
    pub jitter: Duration,
}

impl EmulationCadence {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: delay / 2,
        }
    }

    /// No pauses at all. Still emits one delta per increment.
    pub fn immediate() -> Self {
        Self {
            delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    fn next_pause(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.delay;
        }
        self.delay + Duration::from_millis(fastrand::u64(0..=jitter_ms))
    }
}

/// Split into increments: leading whitespace stays alone, then each word carries
/// the whitespace that follows it. Concatenating the increments gives `text` back.
pub fn split_increments(text: &str) -> Vec<&str> {
    let mut increments = Vec::new();
    let mut start = 0;
    let mut in_trailing_whitespace = false;
    let mut seen_word = false;

    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if seen_word {
                in_trailing_whitespace = true;
            }
        } else {
            if !seen_word && idx > 0 {
                increments.push(&text[start..idx]);
                start = idx;
            } else if in_trailing_whitespace {
                increments.push(&text[start..idx]);
                start = idx;
            }
            seen_word = true;
            in_trailing_whitespace = false;
        }
    }
    if start < text.len() {
        increments.push(&text[start..]);
    }

    increments
}

/// Drip-feed `text` to the client. Stops with a cancellation error as soon as the
/// stream is cancelled between increments.
pub async fn emulate_streaming<S, F>(
    writer: &ChatStreamWriter<S>,
    text: &str,
    cadence: EmulationCadence,
    mut on_increment: F,
) -> Result<()>
where
    S: FrameSink,
    F: FnMut(&str),
{
    let increments = split_increments(text);
    tracing::debug!(
        "Emulating stream of {} chars in {} increments",
        text.len(),
        increments.len()
    );

    for (i, increment) in increments.into_iter().enumerate() {
        if i > 0 {
            let pause = cadence.next_pause();
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
        if writer.controller().is_cancelled() {
            return Err(AgentsError::StreamCancelled.into());
        }
        writer.send_text_chunk(increment).await?;
        writer.metric().record_emulated_increment();
        on_increment(increment);
    }

    Ok(())
}

impl<S: FrameSink> ChatStreamWriter<S> {
    pub async fn emulate_text(&self, text: &str, cadence: EmulationCadence) -> Result<()> {
        emulate_streaming(self, text, cadence, |_| {}).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_increments_reassembles_exactly() {
        let samples = [
            "",
            "word",
            "\n\n---\nPowered by X",
            "  leading and trailing  ",
            "tabs\tand\r\nlines",
            "ünïcödé wörds 🙂 here",
        ];
        for sample in samples {
            assert_eq!(split_increments(sample).concat(), sample);
        }
    }

    #[test]
    fn test_split_increments_shape() {
        assert_eq!(
            split_increments("\n\n---\nPowered by X"),
            vec!["\n\n", "---\n", "Powered ", "by ", "X"]
        );
        assert_eq!(split_increments("   "), vec!["   "]);
        assert!(split_increments("").is_empty());
    }

    #[test]
    fn test_immediate_cadence_never_pauses() {
        assert!(EmulationCadence::immediate().next_pause().is_zero());
        let cadence = EmulationCadence::new(Duration::from_millis(10));
        let pause = cadence.next_pause();
        assert!(pause >= Duration::from_millis(10));
        assert!(pause <= Duration::from_millis(15));
    }
}
