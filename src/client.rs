//! Streaming chat client: reads the response body frame by frame, rebuilds the
//! agent message and runs the tool-call reactor after every visible change.

use futures_util::StreamExt;
use serde::Serialize;
use tokio_util::codec::FramedRead;

use crate::assembler::ChatStreamAssembler;
use crate::constants::{SERVER_VERSION, SERVER_VERSION_HEADER, USER_ID_HEADER};
use crate::decoder::{ChatFrame, ChatFrameDecoder};
use crate::observers::{VersionMismatch, CLIENT_VERSION_MISMATCH};
use crate::reactor::{PendingInteraction, ToolCallReactor};
use crate::types::*;

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub thread: Vec<ChatMessage>,
    pub attachments: Vec<Attachment>,
    pub private_mode: bool,
    pub conversation_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestParameters<'a> {
    is_private_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
}

#[derive(Serialize)]
struct RequestBody<'a> {
    message: &'a str,
    thread: &'a [ChatMessage],
    attachments: &'a [Attachment],
    parameters: RequestParameters<'a>,
}

#[derive(Debug)]
pub enum ChatEvent<'a> {
    Frame(&'a ChatFrame),
    Interaction(&'a PendingInteraction),
}

pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    user: Option<UserId>,
    version: String,
}

impl ChatClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: None,
            version: SERVER_VERSION.to_string(),
        }
    }

    pub fn with_user(mut self, user: UserId) -> Self {
        self.user = Some(user);
        self
    }

    /// Version compared against the server's `x-server-version`.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sends one message and consumes the streamed reply. Returns the completed
    /// agent message.
    pub async fn send<F>(
        &self,
        agent: &str,
        message: &str,
        options: &ChatOptions,
        reactor: &mut ToolCallReactor,
        mut on_event: F,
    ) -> Result<ChatMessage>
    where
        F: FnMut(ChatEvent<'_>),
    {
        let url = format!("{}/agents/{}/api/chat", self.base_url, agent);
        let body = RequestBody {
            message,
            thread: &options.thread,
            attachments: &options.attachments,
            parameters: RequestParameters {
                is_private_mode: options.private_mode,
                conversation_id: options.conversation_id.as_deref(),
            },
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(user) = &self.user {
            request = request.header(USER_ID_HEADER, user.0.as_str());
        }
        let response = request.send().await?;
        self.check_server_version(&response);

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(agent, response).await.into());
        }

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let mut frames = FramedRead::new(
            tokio_util::io::StreamReader::new(bytes_stream),
            ChatFrameDecoder::new(),
        );

        let user_message = ChatMessage::user(message, options.attachments.clone());
        let mut assembler = ChatStreamAssembler::new(agent);
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            on_event(ChatEvent::Frame(&frame));
            if !assembler.apply(frame) {
                continue;
            }

            let mut snapshot = options.thread.clone();
            snapshot.push(user_message.clone());
            snapshot.push(assembler.message().clone());
            for interaction in reactor.observe(&snapshot) {
                on_event(ChatEvent::Interaction(&interaction));
            }
        }

        tracing::debug!(
            "Stream from {} finished after {} keep-alive(s)",
            agent,
            assembler.keep_alives()
        );
        Ok(assembler.finish())
    }

    fn check_server_version(&self, response: &reqwest::Response) {
        let server_version = match response
            .headers()
            .get(SERVER_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some(v) => v,
            None => return,
        };
        if server_version != self.version {
            tracing::warn!(
                "Server version {} differs from client version {}",
                server_version,
                self.version
            );
            CLIENT_VERSION_MISMATCH.notify(&VersionMismatch {
                client_version: self.version.clone(),
                server_version: server_version.to_string(),
            });
        }
    }
}

/// Turns a JSON error response back into the matching error variant.
async fn error_from_response(agent: &str, response: reqwest::Response) -> AgentsError {
    let status = response.status();
    let body: serde_json::Value = match response.json().await {
        Ok(v) => v,
        Err(e) => return AgentsError::Model(format!("Server returned {}: {}", status, e)),
    };
    let error_type = body["error"]["type"].as_str().unwrap_or_default();
    let message = body["error"]["message"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    match error_type {
        "agent_deleted" => AgentsError::AgentDeleted(agent.to_string()),
        "meta_disclaimer_required" => AgentsError::DisclaimerRequired(agent.to_string()),
        "agent_not_found" => AgentsError::AgentNotFound(agent.to_string()),
        "invalid_request" | "serialization_error" => AgentsError::InvalidRequest(message),
        _ => AgentsError::Model(format!("Server returned {}: {}", status, message)),
    }
}
