use crate::constants::*;
use crate::db::DbPool;
use crate::orchestrator::{ChatTurnOrchestrator, OrchestratorConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,
    #[arg(long, env = "AGENTS_PORT", default_value_t = 8080)]
    pub port: u16,
    #[arg(long, env = "AGENTS_HOST", default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, env = "AGENTS_DATABASE", default_value = "agents.db")]
    pub database: String,
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[arg(long, env = "AGENTS_MODEL_BASE_URL", default_value = OPENROUTER_CHAT_COMPLETIONS)]
    pub model_base_url: String,
    #[arg(long, env = "AGENTS_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub openrouter_key: Option<String>,
    #[arg(long, default_value_t = KEEP_ALIVE_INTERVAL_MS)]
    pub keep_alive_interval_ms: u64,
    #[arg(long, default_value_t = SUFFIX_CADENCE_MS)]
    pub suffix_cadence_ms: u64,
    #[arg(long, default_value_t = MAX_STREAM_DURATION_SECS)]
    pub max_stream_duration_secs: u64,
    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_body_size: usize,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Send one message to an agent and print the streamed reply
    Chat {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,
        #[arg(long)]
        agent: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long, default_value_t = false)]
        private: bool,
        /// Position shared when the agent asks for it, as `lat,lon[,accuracy]`
        #[arg(long, env = "AGENTS_LOCATION")]
        location: Option<String>,
        message: String,
    },
    /// Create or replace an agent definition
    RegisterAgent {
        #[arg(long)]
        name: String,
        /// File holding the agent source
        #[arg(long)]
        source_file: PathBuf,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        suffix: Option<String>,
        #[arg(long, default_value_t = false)]
        requires_disclaimer: bool,
    },
    /// Record that a user accepted an agent's disclaimer
    AcceptDisclaimer {
        #[arg(long)]
        user: String,
        #[arg(long)]
        agent: String,
    },
}

impl Args {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            keep_alive_interval: Duration::from_millis(self.keep_alive_interval_ms.max(1)),
            suffix_cadence: Duration::from_millis(self.suffix_cadence_ms),
            max_stream_duration: Duration::from_secs(self.max_stream_duration_secs),
        }
    }

    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ChatTurnOrchestrator>,
    pub db: DbPool,
    pub max_body_size: usize,
}
