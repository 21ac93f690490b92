//! Outgoing chat stream: frame formatting, the stream controller and the writer
//! helpers that are the only way content reaches the response body.
//!
//! Wire format (body is `text/markdown`):
//! - text deltas, whitespace-encoded, written back to back
//! - `\n{"toolCalls":[...]}\n` for a tool-call batch
//! - `\n[KEEP_ALIVE]\n` pings

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::KEEP_ALIVE_TOKEN;
use crate::idempotency::resolve_key;
use crate::logging::StreamMetric;
use crate::types::{AgentsError, Result, ToolCall};
use crate::whitespace;

pub type BodyItem = std::result::Result<Bytes, std::io::Error>;

/// The receiving side is gone; nothing written now will ever be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Underlying byte controller of a response body.
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn send(&self, frame: Bytes) -> std::result::Result<(), SinkClosed>;
    /// End the body normally.
    fn close(&self);
    /// End the body with an error so the client sees a broken stream.
    async fn fail(&self, error: std::io::Error);
}

/// Sink backed by the bounded channel that feeds `Body::from_stream`.
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::Sender<BodyItem>>>,
}

impl ChannelSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BodyItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn sender(&self) -> Option<mpsc::Sender<BodyItem>> {
        match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn take_sender(&self) -> Option<mpsc::Sender<BodyItem>> {
        match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&self, frame: Bytes) -> std::result::Result<(), SinkClosed> {
        let tx = match self.sender() {
            Some(tx) => tx,
            None => return Err(SinkClosed),
        };
        tx.send(Ok(frame)).await.map_err(|_| SinkClosed)
    }

    fn close(&self) {
        drop(self.take_sender());
    }

    async fn fail(&self, error: std::io::Error) {
        if let Some(tx) = self.take_sender() {
            if tx.send(Err(error)).await.is_err() {
                tracing::trace!("Client already disconnected, stream error not delivered");
            }
        }
    }
}

/// Owns the outgoing stream for one request.
///
/// The closed flag is flipped exactly once, whichever path gets there first
/// (abort listener, failed write, normal completion), and only that call touches
/// the sink.
pub struct StreamController<S: FrameSink> {
    sink: S,
    closed: AtomicBool,
    abort: CancellationToken,
}

impl<S: FrameSink> StreamController<S> {
    pub fn new(sink: S, abort: CancellationToken) -> Self {
        Self {
            sink,
            closed: AtomicBool::new(false),
            abort,
        }
    }

    pub fn abort_signal(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closed by us, or the inbound request was aborted.
    pub fn is_cancelled(&self) -> bool {
        self.is_closed() || self.abort.is_cancelled()
    }

    pub async fn enqueue(&self, frame: Bytes) -> Result<()> {
        if self.is_cancelled() {
            return Err(AgentsError::StreamCancelled.into());
        }
        match self.sink.send(frame).await {
            Ok(()) => Ok(()),
            Err(SinkClosed) => {
                tracing::debug!("Write after client disconnect; closing stream");
                self.mark_closed();
                Err(AgentsError::StreamCancelled.into())
            }
        }
    }

    /// Returns true only for the call that actually closed the stream.
    pub fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.sink.close();
        true
    }

    /// Error the stream instead of closing it. No-op once closed.
    pub async fn fail(&self, error: std::io::Error) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sink.fail(error).await;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallsFrame {
    pub tool_calls: Vec<ToolCall>,
}

/// Copy of the batch where every call carries an idempotency key.
pub fn prepare_tool_calls_for_streaming(tool_calls: &[ToolCall]) -> Vec<ToolCall> {
    tool_calls
        .iter()
        .map(|call| {
            let mut prepared = call.clone();
            if prepared.idempotency_key.is_none() {
                prepared.idempotency_key = Some(resolve_key(call));
            }
            prepared
        })
        .collect()
}

pub fn tool_calls_frame(prepared: Vec<ToolCall>) -> Result<String> {
    let json = serde_json::to_string(&ToolCallsFrame {
        tool_calls: prepared,
    })?;
    Ok(format!("\n{}\n", json))
}

pub fn keep_alive_frame() -> String {
    format!("\n{}\n", KEEP_ALIVE_TOKEN)
}

/// Frame emitter used by the orchestrator.
pub struct ChatStreamWriter<S: FrameSink> {
    controller: Arc<StreamController<S>>,
    last_tool_calls_frame: Mutex<Option<String>>,
    metric: Arc<StreamMetric>,
}

impl<S: FrameSink> ChatStreamWriter<S> {
    pub fn new(controller: Arc<StreamController<S>>) -> Self {
        Self {
            controller,
            last_tool_calls_frame: Mutex::new(None),
            metric: Arc::new(StreamMetric::new()),
        }
    }

    pub fn controller(&self) -> &Arc<StreamController<S>> {
        &self.controller
    }

    pub fn metric(&self) -> &StreamMetric {
        &self.metric
    }

    pub async fn send_text_chunk(&self, chunk: &str) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let encoded = whitespace::encode(chunk);
        self.controller.enqueue(Bytes::from(encoded)).await?;
        self.metric.record_text(chunk);
        Ok(())
    }

    /// Sends the batch unless it is empty or identical to the last batch sent.
    pub async fn emit_tool_calls(&self, tool_calls: &[ToolCall]) -> Result<()> {
        if tool_calls.is_empty() {
            return Ok(());
        }
        let frame = tool_calls_frame(prepare_tool_calls_for_streaming(tool_calls))?;

        if !self.remember_tool_calls_frame(&frame) {
            self.metric.record_tool_calls_deduplicated();
            return Ok(());
        }

        self.controller.enqueue(Bytes::from(frame)).await?;
        self.metric.record_tool_calls_frame();
        Ok(())
    }

    pub async fn send_keep_alive(&self) -> Result<()> {
        self.controller
            .enqueue(Bytes::from(keep_alive_frame()))
            .await?;
        self.metric.record_keep_alive();
        Ok(())
    }

    /// Stores `frame` as the last one sent; false when it was already the last one.
    fn remember_tool_calls_frame(&self, frame: &str) -> bool {
        let mut last = match self.last_tool_calls_frame.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if last.as_deref() == Some(frame) {
            return false;
        }
        *last = Some(frame.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<String>>,
        closes: AtomicUsize,
        fails: AtomicUsize,
        refuse_writes: AtomicBool,
    }

    #[async_trait]
    impl FrameSink for Arc<RecordingSink> {
        async fn send(&self, frame: Bytes) -> std::result::Result<(), SinkClosed> {
            if self.refuse_writes.load(Ordering::SeqCst) {
                return Err(SinkClosed);
            }
            self.frames
                .lock()
                .unwrap()
                .push(String::from_utf8(frame.to_vec()).unwrap());
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        async fn fail(&self, _error: std::io::Error) {
            self.fails.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn writer() -> (ChatStreamWriter<Arc<RecordingSink>>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let controller = Arc::new(StreamController::new(
            sink.clone(),
            CancellationToken::new(),
        ));
        (ChatStreamWriter::new(controller), sink)
    }

    #[test]
    fn test_prepare_keeps_fields_and_adds_missing_keys() {
        let mut with_key = ToolCall::new("a");
        with_key.idempotency_key = Some("given".into());
        let mut without_key = ToolCall::new("b");
        without_key.raw_tool_call = json!({"id": "call_9"});
        without_key.result = json!("done");

        let prepared = prepare_tool_calls_for_streaming(&[with_key.clone(), without_key.clone()]);
        assert_eq!(prepared[0], with_key);
        assert_eq!(prepared[1].idempotency_key.as_deref(), Some("raw:call_9"));
        assert_eq!(prepared[1].result, json!("done"));
        assert_eq!(prepared[1].created_at, without_key.created_at);
    }

    #[tokio::test]
    async fn test_same_batch_twice_produces_one_frame() {
        let (writer, sink) = writer();
        let batch = vec![ToolCall {
            name: "search".into(),
            arguments: json!({"q": "rust"}),
            ..ToolCall::default()
        }];

        writer.emit_tool_calls(&batch).await.unwrap();
        writer.emit_tool_calls(&batch).await.unwrap();

        let frames = sink.frames.lock().unwrap().clone();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with("\n{\"toolCalls\":["));
        assert!(frames[0].ends_with("]}\n"));
        assert!(frames[0].contains("\"idempotencyKey\":\"fallback:search:{\\\"q\\\":\\\"rust\\\"}\""));
    }

    #[tokio::test]
    async fn test_changed_batch_is_sent_again() {
        let (writer, sink) = writer();
        let mut call = ToolCall {
            name: "search".into(),
            ..ToolCall::default()
        };
        writer.emit_tool_calls(&[call.clone()]).await.unwrap();
        call.result = json!({"hits": 3});
        writer.emit_tool_calls(&[call]).await.unwrap();
        assert_eq!(sink.frames.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_inputs_are_not_written() {
        let (writer, sink) = writer();
        writer.emit_tool_calls(&[]).await.unwrap();
        writer.send_text_chunk("").await.unwrap();
        assert!(sink.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_text_chunks_are_whitespace_encoded() {
        let (writer, sink) = writer();
        writer.send_text_chunk(" \n").await.unwrap();
        writer.send_keep_alive().await.unwrap();
        let frames = sink.frames.lock().unwrap().clone();
        assert_eq!(frames, vec!["[WS:SPACE][WS:NEWLINE]", "\n[KEEP_ALIVE]\n"]);
        assert_eq!(writer.metric().snapshot().text_chunks, 1);
        assert_eq!(writer.metric().snapshot().keep_alives, 1);
    }

    #[tokio::test]
    async fn test_mark_closed_closes_exactly_once_under_concurrency() {
        let (writer, sink) = writer();
        let controller = writer.controller().clone();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let c = controller.clone();
            handles.push(tokio::spawn(async move { c.mark_closed() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        controller.mark_closed();
        controller.fail(std::io::Error::other("late")).await;

        assert_eq!(winners, 1);
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
        assert_eq!(sink.fails.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_writes_after_close_or_abort_are_cancellations() {
        let (writer, sink) = writer();
        writer.controller().mark_closed();
        let err = writer.send_text_chunk("hi").await.unwrap_err();
        assert!(err.is_cancellation());
        assert!(sink.frames.lock().unwrap().is_empty());

        let sink = Arc::new(RecordingSink::default());
        let abort = CancellationToken::new();
        let controller = Arc::new(StreamController::new(sink.clone(), abort.clone()));
        abort.cancel();
        let err = ChatStreamWriter::new(controller)
            .send_keep_alive()
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_refused_write_is_normalized_and_closes_stream() {
        let (writer, sink) = writer();
        sink.refuse_writes.store(true, Ordering::SeqCst);
        let err = writer.send_text_chunk("hi").await.unwrap_err();
        assert!(err.is_cancellation());
        assert!(writer.controller().is_closed());
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_sink_reports_dropped_receiver() {
        let (sink, rx) = ChannelSink::channel(4);
        sink.send(Bytes::from_static(b"a")).await.unwrap();
        drop(rx);
        assert_eq!(sink.send(Bytes::from_static(b"b")).await, Err(SinkClosed));
    }

    #[tokio::test]
    async fn test_channel_sink_close_ends_receiver() {
        let (sink, mut rx) = ChannelSink::channel(4);
        sink.send(Bytes::from_static(b"a")).await.unwrap();
        sink.close();
        assert_eq!(rx.recv().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert!(rx.recv().await.is_none());
        assert_eq!(sink.send(Bytes::from_static(b"b")).await, Err(SinkClosed));
    }
}
