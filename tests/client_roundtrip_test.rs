mod common;

use agents_server::client::{ChatClient, ChatEvent, ChatOptions};
use agents_server::constants::{SERVER_VERSION, TOOL_REQUEST_WALLET_RECORD};
use agents_server::db::init_memory_db;
use agents_server::decoder::ChatFrame;
use agents_server::handlers::router;
use agents_server::model::{ModelChunk, ModelResponse};
use agents_server::observers::CLIENT_VERSION_MISMATCH;
use agents_server::orchestrator::ChatTurnOrchestrator;
use agents_server::reactor::{PendingInteraction, ToolCallReactor, WalletRecordType};
use agents_server::types::*;
use agents_server::AppState;
use common::*;
use serde_json::json;
use std::sync::{Arc, Mutex};

/// Serves the router on an ephemeral port and returns its base URL.
async fn spawn_server(agents: StaticAgents, model: ScriptedModel) -> String {
    let db = match init_memory_db().await {
        Ok(db) => db,
        Err(e) => panic!("Failed to open DB: {:?}", e),
    };
    let orchestrator = ChatTurnOrchestrator::new(
        collaborators(
            Arc::new(agents),
            Arc::new(RecordingRecorder::default()),
            Arc::new(model),
        ),
        test_config(),
    );
    let app = router(AppState {
        orchestrator: Arc::new(orchestrator),
        db,
        max_body_size: 64 * 1024,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn wallet_call() -> ToolCall {
    ToolCall {
        name: TOOL_REQUEST_WALLET_RECORD.to_string(),
        arguments: json!({"recordType": "username-password", "service": "github"}),
        raw_tool_call: json!({"id": "call_wallet"}),
        ..ToolCall::default()
    }
}

#[tokio::test]
async fn test_client_rebuilds_message_and_reacts_once() {
    let model = ScriptedModel::new(
        vec![
            Step::Chunk(ModelChunk {
                content: String::new(),
                tool_calls: Some(vec![wallet_call()]),
            }),
            Step::Chunk(ModelChunk::text("I need your\n")),
            Step::Chunk(ModelChunk::text("GitHub login.")),
        ],
        Ok(ModelResponse {
            content: "I need your\nGitHub login.".to_string(),
            tool_calls: vec![wallet_call()],
            ..ModelResponse::default()
        }),
    );
    let base_url = spawn_server(StaticAgents::with(vec![agent("helper")]), model).await;

    let client = ChatClient::new(reqwest::Client::new(), base_url).with_user(UserId("u1".into()));
    let mut reactor = ToolCallReactor::new();
    let mut interactions = Vec::new();
    let mut text = String::new();

    let message = client
        .send(
            "helper",
            "log me in",
            &ChatOptions::default(),
            &mut reactor,
            |event| match event {
                ChatEvent::Frame(ChatFrame::Text(t)) => text.push_str(t),
                ChatEvent::Frame(_) => {}
                ChatEvent::Interaction(i) => interactions.push(i.clone()),
            },
        )
        .await
        .unwrap();

    assert_eq!(text, "I need your\nGitHub login.");
    assert_eq!(message.content, "I need your\nGitHub login.");
    assert_eq!(message.sender, "helper");
    assert_eq!(message.tool_calls().len(), 1);

    assert_eq!(interactions.len(), 1);
    match &interactions[0] {
        PendingInteraction::WalletRequest(w) => {
            assert_eq!(w.record_type, WalletRecordType::UsernamePassword);
            assert_eq!(w.service.as_deref(), Some("github"));
        }
        other => panic!("Unexpected interaction: {:?}", other),
    }
}

#[tokio::test]
async fn test_client_maps_policy_errors() {
    let mut retired = agent("retired");
    retired.deleted = true;
    let base_url = spawn_server(
        StaticAgents::with(vec![retired]),
        ScriptedModel::text(&["unused"]),
    )
    .await;

    let client = ChatClient::new(reqwest::Client::new(), base_url);
    let result = client
        .send(
            "retired",
            "hi",
            &ChatOptions::default(),
            &mut ToolCallReactor::new(),
            |_| {},
        )
        .await;

    match result {
        Err(e) => assert!(matches!(e.inner, AgentsError::AgentDeleted(_))),
        Ok(m) => panic!("Expected an error, got {:?}", m),
    }
}

#[tokio::test]
async fn test_version_mismatch_notifies_observers() {
    let base_url = spawn_server(
        StaticAgents::with(vec![agent("helper")]),
        ScriptedModel::text(&["ok"]),
    )
    .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = CLIENT_VERSION_MISMATCH.subscribe(move |m| {
        sink.lock().unwrap().push(m.clone());
    });

    let client = ChatClient::new(reqwest::Client::new(), base_url).with_version("0.0.0-stale");
    client
        .send(
            "helper",
            "hi",
            &ChatOptions::default(),
            &mut ToolCallReactor::new(),
            |_| {},
        )
        .await
        .unwrap();
    subscription.unsubscribe();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].client_version, "0.0.0-stale");
    assert_eq!(seen[0].server_version, SERVER_VERSION);
}
