#![allow(dead_code)]

use agents_server::agents::*;
use agents_server::decoder::{ChatFrame, ChatFrameDecoder};
use agents_server::frames::{FrameSink, SinkClosed};
use agents_server::model::*;
use agents_server::orchestrator::{OrchestratorConfig, TurnCollaborators};
use agents_server::recorder::{HistoryRecorder, RecordRequest};
use agents_server::types::*;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

pub const SUFFIX: &str = "\n\n---\nPowered by X";

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        keep_alive_interval: Duration::from_millis(10),
        suffix_cadence: Duration::ZERO,
        max_stream_duration: Duration::from_secs(300),
    }
}

pub fn agent(name: &str) -> ResolvedAgent {
    ResolvedAgent {
        agent_id: format!("id-{}", name),
        agent_name: name.to_string(),
        display_name: name.to_string(),
        source: "You are helpful.".to_string(),
        message_suffix: None,
        requires_disclaimer: false,
        deleted: false,
        origin: "http://localhost".to_string(),
    }
}

/// --- MODEL ---

pub enum Step {
    Chunk(ModelChunk),
    Sleep(Duration),
    /// Simulates the client going away.
    Abort(CancellationToken),
}

pub struct ScriptedModel {
    steps: Mutex<Vec<Step>>,
    result: std::result::Result<ModelResponse, String>,
    pub calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(steps: Vec<Step>, result: std::result::Result<ModelResponse, String>) -> Self {
        Self {
            steps: Mutex::new(steps),
            result,
            calls: AtomicUsize::new(0),
        }
    }

    /// Streams `parts` as text chunks and answers with their concatenation.
    pub fn text(parts: &[&str]) -> Self {
        let steps = parts
            .iter()
            .map(|p| Step::Chunk(ModelChunk::text(*p)))
            .collect();
        Self::new(
            steps,
            Ok(ModelResponse {
                content: parts.concat(),
                ..ModelResponse::default()
            }),
        )
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn stream_chat(
        &self,
        _prompt: &ChatPrompt,
        on_chunk: ChunkSender,
        _cancel: CancellationToken,
    ) -> Result<ModelResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let steps: Vec<Step> = std::mem::take(&mut *self.steps.lock().unwrap());
        for step in steps {
            match step {
                Step::Chunk(chunk) => {
                    let _ = on_chunk.send(chunk);
                }
                Step::Sleep(d) => tokio::time::sleep(d).await,
                Step::Abort(token) => token.cancel(),
            }
        }
        match &self.result {
            Ok(r) => Ok(r.clone()),
            Err(message) => Err(AgentsError::Model(message.clone()).into()),
        }
    }
}

/// --- RECORDER ---

#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub conversation_id: ConversationId,
    pub message: ChatMessage,
    pub previous_message_hash: Option<MessageHash>,
    pub enabled: bool,
}

#[derive(Default)]
pub struct RecordingRecorder {
    pub records: Mutex<Vec<RecordedMessage>>,
}

impl RecordingRecorder {
    pub fn records(&self) -> Vec<RecordedMessage> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoryRecorder for RecordingRecorder {
    async fn record(&self, request: RecordRequest<'_>) -> Result<Option<MessageHash>> {
        let mut records = self.records.lock().unwrap();
        records.push(RecordedMessage {
            conversation_id: request.conversation_id.clone(),
            message: request.message.clone(),
            previous_message_hash: request.previous_message_hash.cloned(),
            enabled: request.enabled,
        });
        if !request.enabled {
            return Ok(None);
        }
        Ok(Some(MessageHash(format!("hash-{}", records.len()))))
    }
}

/// --- AGENTS ---

#[derive(Default)]
pub struct StaticAgents {
    pub agents: HashMap<String, ResolvedAgent>,
    pub accepted: HashSet<(String, String)>,
    pub saved_sources: Mutex<Vec<(String, String)>>,
}

impl StaticAgents {
    pub fn with(agents: Vec<ResolvedAgent>) -> Self {
        Self {
            agents: agents
                .into_iter()
                .map(|a| (a.agent_name.clone(), a))
                .collect(),
            ..Self::default()
        }
    }

    pub fn accept(mut self, user: &str, agent_id: &str) -> Self {
        self.accepted.insert((user.to_string(), agent_id.to_string()));
        self
    }
}

#[async_trait]
impl AgentResolver for StaticAgents {
    async fn resolve(&self, agent_name: &str, origin: &str) -> Result<ResolvedAgent> {
        match self.agents.get(agent_name) {
            Some(agent) => {
                let mut agent = agent.clone();
                agent.origin = origin.to_string();
                Ok(agent)
            }
            None => Err(AgentsError::AgentNotFound(agent_name.to_string()).into()),
        }
    }
}

#[async_trait]
impl AgentCollection for StaticAgents {
    async fn update_agent_source(&self, agent_id: &str, source: &str) -> Result<()> {
        self.saved_sources
            .lock()
            .unwrap()
            .push((agent_id.to_string(), source.to_string()));
        Ok(())
    }
}

#[async_trait]
impl DisclaimerStore for StaticAgents {
    async fn status(&self, user: &UserId, agent_id: &str) -> Result<DisclaimerStatus> {
        Ok(DisclaimerStatus {
            accepted: self
                .accepted
                .contains(&(user.0.clone(), agent_id.to_string())),
        })
    }
}

pub fn collaborators(
    agents: Arc<StaticAgents>,
    recorder: Arc<RecordingRecorder>,
    model: Arc<ScriptedModel>,
) -> TurnCollaborators {
    TurnCollaborators {
        resolver: agents.clone(),
        collection: agents.clone(),
        disclaimers: agents,
        recorder,
        model,
    }
}

/// --- SINK ---

#[derive(Default)]
pub struct SinkLog {
    pub frames: Mutex<Vec<Bytes>>,
    pub closes: AtomicUsize,
    pub fails: AtomicUsize,
    pub refuse_writes: AtomicBool,
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    pub log: Arc<SinkLog>,
}

impl RecordingSink {
    pub fn body(&self) -> Vec<u8> {
        self.log
            .frames
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.to_vec())
            .collect()
    }

    pub fn frame_count(&self) -> usize {
        self.log.frames.lock().unwrap().len()
    }

    pub fn closes(&self) -> usize {
        self.log.closes.load(Ordering::SeqCst)
    }

    pub fn fails(&self) -> usize {
        self.log.fails.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send(&self, frame: Bytes) -> std::result::Result<(), SinkClosed> {
        if self.log.refuse_writes.load(Ordering::SeqCst) {
            return Err(SinkClosed);
        }
        self.log.frames.lock().unwrap().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn fail(&self, _error: std::io::Error) {
        self.log.fails.fetch_add(1, Ordering::SeqCst);
    }
}

/// --- DECODING ---

pub fn decode_body(body: &[u8]) -> Vec<ChatFrame> {
    let mut decoder = ChatFrameDecoder::new();
    let mut buf = BytesMut::from(body);
    let mut frames = Vec::new();
    while let Some(frame) = decoder.decode_eof(&mut buf).unwrap() {
        frames.push(frame);
    }
    frames
}

/// Decodes every written frame on its own, preserving write boundaries.
pub fn written_frames(sink: &RecordingSink) -> Vec<ChatFrame> {
    let frames = sink.log.frames.lock().unwrap().clone();
    frames.iter().flat_map(|f| decode_body(f)).collect()
}

pub fn text_deltas(frames: &[ChatFrame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            ChatFrame::Text(t) => Some(t.clone()),
            _ => None,
        })
        .collect()
}

pub fn tool_call_frames(frames: &[ChatFrame]) -> Vec<Vec<ToolCall>> {
    frames
        .iter()
        .filter_map(|f| match f {
            ChatFrame::ToolCalls(calls) => Some(calls.clone()),
            _ => None,
        })
        .collect()
}
