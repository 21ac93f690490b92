//! One chat turn, from request validation to the closed response stream.
//!
//! `prepare_turn` is the INIT phase: everything that can still be answered with a
//! JSON error. `ChatTurnOrchestrator::run` owns the open stream and drives it to
//! exactly one of COMPLETED, CANCELLED or ERRORED.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::agents::{AgentCollection, AgentResolver, DisclaimerStore, ResolvedAgent};
use crate::constants::{
    EMPTY_RESPONSE_NOTICE, KEEP_ALIVE_INTERVAL_MS, MAX_STREAM_DURATION_SECS, SUFFIX_CADENCE_MS,
};
use crate::emulation::EmulationCadence;
use crate::frames::{ChatStreamWriter, FrameSink, StreamController};
use crate::ingress::{normalize_attachments, ChatParameters, ChatRequestBody};
use crate::model::{ChatModel, ChatPrompt, ModelResponse};
use crate::recorder::{HistoryRecorder, RecordRequest};
use crate::str_utils::log_preview;
use crate::types::*;

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub keep_alive_interval: Duration,
    pub suffix_cadence: Duration,
    pub max_stream_duration: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_millis(KEEP_ALIVE_INTERVAL_MS),
            suffix_cadence: Duration::from_millis(SUFFIX_CADENCE_MS),
            max_stream_duration: Duration::from_secs(MAX_STREAM_DURATION_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Init,
    Streaming,
    Completed,
    Cancelled,
    Errored,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Init => "INIT",
            TurnState::Streaming => "STREAMING",
            TurnState::Completed => "COMPLETED",
            TurnState::Cancelled => "CANCELLED",
            TurnState::Errored => "ERRORED",
        }
    }
}

/// External services a turn talks to.
#[derive(Clone)]
pub struct TurnCollaborators {
    pub resolver: Arc<dyn AgentResolver>,
    pub collection: Arc<dyn AgentCollection>,
    pub disclaimers: Arc<dyn DisclaimerStore>,
    pub recorder: Arc<dyn HistoryRecorder>,
    pub model: Arc<dyn ChatModel>,
}

/// A validated turn, ready to stream.
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    pub request_id: RequestId,
    pub agent: ResolvedAgent,
    pub user: Option<UserId>,
    pub conversation_id: ConversationId,
    pub parameters: ChatParameters,
    pub prompt: ChatPrompt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub state: TurnState,
    /// Model message content as persisted (suffix included).
    pub content: String,
    pub user_message_hash: Option<MessageHash>,
    pub model_message_hash: Option<MessageHash>,
}

/// INIT: parse the body, resolve the agent and apply the policy gates.
pub async fn prepare_turn(
    collaborators: &TurnCollaborators,
    agent_name: &str,
    origin: &str,
    user: Option<UserId>,
    body: &[u8],
) -> Result<PreparedTurn> {
    let request = ChatRequestBody::parse(body)?;
    let user_text = request.user_message();
    let attachments = normalize_attachments(&request.attachments);
    let parameters = ChatParameters::from_value(&request.parameters);

    let agent = collaborators.resolver.resolve(agent_name, origin).await?;
    if agent.deleted {
        return Err(AgentsError::AgentDeleted(agent.agent_name).into());
    }

    if agent.requires_disclaimer {
        let accepted = match &user {
            Some(user) => {
                collaborators
                    .disclaimers
                    .status(user, &agent.agent_id)
                    .await?
                    .accepted
            }
            None => false,
        };
        if !accepted {
            return Err(AgentsError::DisclaimerRequired(agent.agent_name).into());
        }
    }

    let conversation_id = parameters.conversation_key(&agent.agent_id, user.as_ref());
    let system = match &parameters.book {
        Some(book) => book.clone(),
        None => agent.source.clone(),
    };
    let prompt = ChatPrompt {
        agent_name: agent.agent_name.clone(),
        system,
        thread: request.thread,
        user_message: ChatMessage::user(user_text, attachments),
    };

    info!(
        "[INIT] agent={} conversation={} private={} book={} | {}",
        agent.agent_name,
        conversation_id.short(),
        parameters.private_mode,
        parameters.is_book_context(),
        log_preview(&prompt.user_message.content, 60)
    );

    Ok(PreparedTurn {
        request_id: RequestId::new(),
        agent,
        user,
        conversation_id,
        parameters,
        prompt,
    })
}

/// Aborts the per-turn background tasks when the turn scope ends.
struct TurnTimers {
    handles: Vec<JoinHandle<()>>,
}

impl Drop for TurnTimers {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// What the client has been sent and what must be persisted so far.
#[derive(Default)]
struct TurnProgress {
    /// Text the client has received.
    sent: String,
    /// Model message content to persist.
    content: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    persisted: bool,
    user_message_hash: Option<MessageHash>,
    model_message_hash: Option<MessageHash>,
}

/// Result of forwarding live model output to the client.
struct PumpResult {
    sent: String,
    meaningful_delta: bool,
    write_error: Option<ObservedError>,
}

pub struct ChatTurnOrchestrator {
    collaborators: TurnCollaborators,
    config: OrchestratorConfig,
}

impl ChatTurnOrchestrator {
    pub fn new(collaborators: TurnCollaborators, config: OrchestratorConfig) -> Self {
        Self {
            collaborators,
            config,
        }
    }

    pub fn collaborators(&self) -> &TurnCollaborators {
        &self.collaborators
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Streams the prepared turn into `sink` until a terminal state. `abort` is the
    /// inbound request's abort signal. Never fails: errors end up in the stream.
    pub async fn run<S: FrameSink>(
        &self,
        turn: PreparedTurn,
        sink: S,
        abort: CancellationToken,
    ) -> TurnOutcome {
        let span = info_span!(
            "turn",
            agent = %turn.agent.agent_name,
            request_id = %turn.request_id.short()
        );
        self.run_turn(turn, sink, abort).instrument(span).await
    }

    async fn run_turn<S: FrameSink>(
        &self,
        turn: PreparedTurn,
        sink: S,
        abort: CancellationToken,
    ) -> TurnOutcome {
        let controller = Arc::new(StreamController::new(sink, abort.clone()));
        let writer = Arc::new(ChatStreamWriter::new(controller.clone()));
        // Stops generation early; fired by the abort listener and by failed writes.
        let generation_cancel = abort.child_token();
        let mut progress = TurnProgress::default();

        info!("[{}] conversation={}", TurnState::Streaming.as_str(), turn.conversation_id.short());
        let result = match writer.send_keep_alive().await {
            Ok(()) => {
                let _timers = self.start_timers(&writer, &abort, &generation_cancel);
                self.stream_turn(&turn, &writer, &generation_cancel, &mut progress)
                    .await
            }
            Err(e) => Err(e),
        };

        let state = match result {
            Ok(()) => {
                controller.mark_closed();
                TurnState::Completed
            }
            Err(e) if e.is_cancellation() || controller.is_cancelled() => {
                debug!("Turn cancelled: {}", e.inner);
                generation_cancel.cancel();
                if !progress.persisted {
                    if let Err(e) = self.persist(&turn, &mut progress).await {
                        warn!("Persisting cancelled turn failed: {}", e.inner);
                    }
                }
                controller.mark_closed();
                TurnState::Cancelled
            }
            Err(e) => {
                error!("Turn failed: {}", e);
                generation_cancel.cancel();
                controller
                    .fail(std::io::Error::other(e.inner.to_string()))
                    .await;
                TurnState::Errored
            }
        };

        info!("[{}] {} chars", state.as_str(), progress.content.len());
        writer.metric().log_summary(state.as_str());

        TurnOutcome {
            state,
            content: progress.content,
            user_message_hash: progress.user_message_hash,
            model_message_hash: progress.model_message_hash,
        }
    }

    /// Periodic keep-alive plus the abort listener, which also enforces the
    /// maximum stream duration.
    fn start_timers<S: FrameSink>(
        &self,
        writer: &Arc<ChatStreamWriter<S>>,
        abort: &CancellationToken,
        generation_cancel: &CancellationToken,
    ) -> TurnTimers {
        let keep_alive = {
            let writer = writer.clone();
            let generation_cancel = generation_cancel.clone();
            // interval_at panics on a zero period.
            let interval = self.config.keep_alive_interval.max(Duration::from_millis(1));
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                loop {
                    ticker.tick().await;
                    if let Err(e) = writer.send_keep_alive().await {
                        debug!("Keep-alive stopped: {}", e.inner);
                        generation_cancel.cancel();
                        break;
                    }
                }
            })
        };

        let abort_listener = {
            let controller = writer.controller().clone();
            let abort = abort.clone();
            let generation_cancel = generation_cancel.clone();
            let max_duration = self.config.max_stream_duration;
            tokio::spawn(async move {
                tokio::select! {
                    _ = abort.cancelled() => {
                        info!("Client disconnected, closing stream");
                    }
                    _ = tokio::time::sleep(max_duration) => {
                        warn!("Stream exceeded {:?}, closing", max_duration);
                    }
                }
                controller.mark_closed();
                generation_cancel.cancel();
            })
        };

        TurnTimers {
            handles: vec![keep_alive, abort_listener],
        }
    }

    async fn stream_turn<S: FrameSink>(
        &self,
        turn: &PreparedTurn,
        writer: &ChatStreamWriter<S>,
        generation_cancel: &CancellationToken,
        progress: &mut TurnProgress,
    ) -> Result<()> {
        let (response, pump) = self.generate(turn, writer, generation_cancel).await;
        progress.sent = pump.sent;
        progress.content = progress.sent.clone();

        let response = response?;
        progress.content = response.content.clone();
        progress.tool_calls = response.tool_calls.clone();
        progress.usage = response.usage.clone();

        if let Some(e) = pump.write_error {
            return Err(e);
        }
        if writer.controller().is_cancelled() {
            return Err(AgentsError::StreamCancelled.into());
        }

        if response.content.trim().is_empty() && !pump.meaningful_delta {
            info!("Model produced no visible text, sending fallback notice");
            writer.send_text_chunk(EMPTY_RESPONSE_NOTICE).await?;
            progress.sent.push_str(EMPTY_RESPONSE_NOTICE);
            progress.content = EMPTY_RESPONSE_NOTICE.to_string();
        }

        let suffix = turn.agent.message_suffix.as_deref().unwrap_or("");
        let full = format!("{}{}", progress.content, suffix);
        // Only the part the client has not seen yet goes out.
        let delta = full
            .strip_prefix(progress.sent.as_str())
            .unwrap_or(suffix)
            .to_string();
        progress.content = full;
        if !delta.is_empty() {
            debug!("Emulating {} unsent chars", delta.len());
            writer
                .emulate_text(&delta, EmulationCadence::new(self.config.suffix_cadence))
                .await?;
        }

        self.persist(turn, progress).await?;
        self.save_learning(turn, &response).await?;

        writer.emit_tool_calls(&response.tool_calls).await?;
        Ok(())
    }

    /// Runs the model call and forwards its chunks to the client concurrently.
    async fn generate<S: FrameSink>(
        &self,
        turn: &PreparedTurn,
        writer: &ChatStreamWriter<S>,
        generation_cancel: &CancellationToken,
    ) -> (Result<ModelResponse>, PumpResult) {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let model_call =
            self.collaborators
                .model
                .stream_chat(&turn.prompt, tx, generation_cancel.clone());

        let pump = async {
            let mut result = PumpResult {
                sent: String::new(),
                meaningful_delta: false,
                write_error: None,
            };
            while let Some(chunk) = rx.recv().await {
                // Drain but discard once the stream is gone.
                if result.write_error.is_some() || writer.controller().is_cancelled() {
                    continue;
                }
                if !chunk.content.is_empty() {
                    if !chunk.content.trim().is_empty() {
                        result.meaningful_delta = true;
                    }
                    match writer.send_text_chunk(&chunk.content).await {
                        Ok(()) => result.sent.push_str(&chunk.content),
                        Err(e) => {
                            generation_cancel.cancel();
                            result.write_error = Some(e);
                            continue;
                        }
                    }
                }
                if let Some(tool_calls) = &chunk.tool_calls {
                    if let Err(e) = writer.emit_tool_calls(tool_calls).await {
                        generation_cancel.cancel();
                        result.write_error = Some(e);
                    }
                }
            }
            result
        };

        tokio::join!(model_call, pump)
    }

    /// Records the user message, then the model message chained to it.
    async fn persist(&self, turn: &PreparedTurn, progress: &mut TurnProgress) -> Result<()> {
        progress.persisted = true;
        let enabled = !turn.parameters.private_mode;
        let recorder = &self.collaborators.recorder;

        progress.user_message_hash = recorder
            .record(RecordRequest {
                conversation_id: &turn.conversation_id,
                message: &turn.prompt.user_message,
                previous_message_hash: None,
                usage: None,
                enabled,
            })
            .await?;

        if progress.content.is_empty() && progress.tool_calls.is_empty() {
            debug!("No model content to persist");
            return Ok(());
        }

        let mut model_message = ChatMessage::agent(turn.agent.agent_name.clone());
        model_message.content = progress.content.clone();
        model_message.is_complete = true;
        if !progress.tool_calls.is_empty() {
            model_message.tool_calls = Some(progress.tool_calls.clone());
        }

        progress.model_message_hash = recorder
            .record(RecordRequest {
                conversation_id: &turn.conversation_id,
                message: &model_message,
                previous_message_hash: progress.user_message_hash.as_ref(),
                usage: progress.usage.as_ref(),
                enabled,
            })
            .await?;
        Ok(())
    }

    async fn save_learning(&self, turn: &PreparedTurn, response: &ModelResponse) -> Result<()> {
        let updated = match &response.updated_agent_source {
            Some(source) if *source != turn.agent.source => source,
            _ => return Ok(()),
        };
        if turn.parameters.private_mode || turn.parameters.is_book_context() {
            debug!("Skipping learning save for private or book turn");
            return Ok(());
        }
        self.collaborators
            .collection
            .update_agent_source(&turn.agent.agent_id, updated)
            .await
    }
}
