use agents_server::agents::{
    AgentDefinition, AgentResolver, SqliteAgentRegistry, SqliteDisclaimerStore,
};
use agents_server::client::{ChatClient, ChatEvent, ChatOptions};
use agents_server::db::init_db;
use agents_server::decoder::ChatFrame;
use agents_server::handlers::router;
use agents_server::logging::{init_tracing, setup_panic_hook};
use agents_server::main_helper::{AppState, Args, Command};
use agents_server::model::OpenAiCompatibleModel;
use agents_server::observers::CLIENT_VERSION_MISMATCH;
use agents_server::orchestrator::{ChatTurnOrchestrator, TurnCollaborators};
use agents_server::constants::GEOLOCATION_TIMEOUT_SECS;
use agents_server::reactor::{
    request_user_location, ConfiguredLocationProvider, LocationOutcome, PendingInteraction,
    ToolCallReactor,
};
use agents_server::recorder::SqliteHistoryRecorder;
use agents_server::types::UserId;
use clap::Parser;
use colored::*;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _guards = init_tracing(&args.log_dir);
    setup_panic_hook();

    let command = args.command.clone().unwrap_or(Command::Serve);
    match command {
        Command::Serve => serve(args).await,
        Command::Chat {
            server,
            agent,
            user,
            private,
            location,
            message,
        } => chat(&args, &server, &agent, user, private, location, &message).await,
        Command::RegisterAgent {
            name,
            source_file,
            display_name,
            suffix,
            requires_disclaimer,
        } => {
            let source = match tokio::fs::read_to_string(&source_file).await {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("Failed to read {}: {}", source_file.display(), e);
                    std::process::exit(1);
                }
            };
            let registry = SqliteAgentRegistry::new(open_db(&args).await);
            let definition = AgentDefinition {
                name,
                display_name,
                source,
                message_suffix: suffix,
                requires_disclaimer,
            };
            match registry.upsert(&definition).await {
                Ok(id) => println!("{} {} ({})", "Registered".green(), definition.name, id),
                Err(e) => {
                    eprintln!("{} {}", "Failed:".red(), e.inner);
                    std::process::exit(1);
                }
            }
        }
        Command::AcceptDisclaimer { user, agent } => {
            let pool = open_db(&args).await;
            let registry = SqliteAgentRegistry::new(pool.clone());
            let store = SqliteDisclaimerStore::new(pool);
            let agent_id = match registry.resolve(&agent, "").await {
                Ok(a) => a.agent_id,
                Err(e) => {
                    eprintln!("{} {}", "Failed:".red(), e.inner);
                    std::process::exit(1);
                }
            };
            if let Err(e) = store.accept(&UserId(user.clone()), &agent_id).await {
                eprintln!("{} {}", "Failed:".red(), e.inner);
                std::process::exit(1);
            }
            println!("{} {} accepted the disclaimer of {}", "OK".green(), user, agent);
        }
    }
}

async fn open_db(args: &Args) -> agents_server::db::DbPool {
    match init_db(&args.database).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    }
}

async fn serve(args: Args) {
    let db = open_db(&args).await;

    let client = match args.http_client() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };
    if args.openrouter_key.is_none() {
        tracing::warn!("OPENROUTER_API_KEY is not set; chat turns will fail with a model error");
    }

    let registry = Arc::new(SqliteAgentRegistry::new(db.clone()));
    let collaborators = TurnCollaborators {
        resolver: registry.clone(),
        collection: registry,
        disclaimers: Arc::new(SqliteDisclaimerStore::new(db.clone())),
        recorder: Arc::new(SqliteHistoryRecorder::new(db.clone())),
        model: Arc::new(OpenAiCompatibleModel::new(
            client,
            args.model_base_url.clone(),
            args.model.clone(),
            args.openrouter_key.clone(),
        )),
    };

    let state = AppState {
        orchestrator: Arc::new(ChatTurnOrchestrator::new(
            collaborators,
            args.orchestrator_config(),
        )),
        db,
        max_body_size: args.max_body_size,
    };
    let app = router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Agents server listening on {}", addr);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutting down");
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("Server error: {}", e);
    }
}

async fn chat(
    args: &Args,
    server: &str,
    agent: &str,
    user: Option<String>,
    private: bool,
    location: Option<String>,
    message: &str,
) {
    let http = match args.http_client() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };
    let mut client = ChatClient::new(http, server);
    if let Some(user) = user {
        client = client.with_user(UserId(user));
    }

    let mismatch = CLIENT_VERSION_MISMATCH.subscribe(|m| {
        eprintln!(
            "{}",
            format!(
                "[server is running {}, this client is {}]",
                m.server_version, m.client_version
            )
            .yellow()
        );
    });

    let options = ChatOptions {
        private_mode: private,
        ..ChatOptions::default()
    };
    let mut reactor = ToolCallReactor::new();
    let mut location_requested = false;
    let result = client
        .send(agent, message, &options, &mut reactor, |event| match event {
            ChatEvent::Frame(ChatFrame::Text(text)) => {
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
            ChatEvent::Frame(ChatFrame::ToolCalls(calls)) => {
                for call in calls {
                    eprintln!("{}", format!("\n[tool] {}", call.name).cyan());
                }
            }
            ChatEvent::Frame(ChatFrame::KeepAlive) => {}
            ChatEvent::Interaction(interaction) => {
                if matches!(interaction, PendingInteraction::LocationRequest(_)) {
                    location_requested = true;
                }
                print_interaction(interaction);
            }
        })
        .await;
    mismatch.unsubscribe();

    if location_requested {
        let provider = ConfiguredLocationProvider::new(location);
        let timeout = Duration::from_secs(GEOLOCATION_TIMEOUT_SECS);
        match request_user_location(&provider, timeout).await {
            LocationOutcome::Resolved(p) => eprintln!(
                "{}",
                format!("[location] {}, {}", p.latitude, p.longitude).cyan()
            ),
            LocationOutcome::Denied(reason) => {
                eprintln!("{}", format!("[location unavailable: {}]", reason).yellow())
            }
            LocationOutcome::TimedOut => eprintln!("{}", "[location request timed out]".yellow()),
        }
    }

    match result {
        Ok(_) => println!(),
        Err(e) => {
            eprintln!("\n{} {}", "Chat failed:".red().bold(), e.inner);
            std::process::exit(1);
        }
    }
}

fn print_interaction(interaction: &PendingInteraction) {
    let line = match interaction {
        PendingInteraction::LocationRequest(_) => "The agent asks for your location.".to_string(),
        PendingInteraction::PrivacyConfirmation(_) => {
            "The agent asks to switch this chat to private mode.".to_string()
        }
        PendingInteraction::PseudoUserReply(p) => {
            format!("{} is waiting for a reply: {}", p.teammate_label, p.prompt)
        }
        PendingInteraction::WalletRequest(w) => format!(
            "The agent needs a {:?} credential{}",
            w.record_type,
            w.service
                .as_deref()
                .map(|s| format!(" for {}", s))
                .unwrap_or_default()
        ),
    };
    eprintln!("{}", format!("\n[action] {}", line).magenta().bold());
}
