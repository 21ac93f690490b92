/// Keep-alive token written between newlines so the client can tell it apart from text.
pub const KEEP_ALIVE_TOKEN: &str = "[KEEP_ALIVE]";

/// Default interval between keep-alive frames on an open chat stream.
pub const KEEP_ALIVE_INTERVAL_MS: u64 = 5_000;

/// Hard ceiling on one streamed response, matching the hosting platform's `maxDuration`.
pub const MAX_STREAM_DURATION_SECS: u64 = 300;

/// Delay between increments when a known trailer is drip-fed to the client.
pub const SUFFIX_CADENCE_MS: u64 = 15;

/// Bounded channel capacity between the orchestrator and the response body.
pub const STREAM_CHANNEL_CAPACITY: usize = 100;

/// Used when the request carries no (or only blank) user text.
pub const DEFAULT_USER_MESSAGE: &str = "Hello! Tell me what you can help me with.";

/// Sent instead of dead air when the model produced no visible text at all.
pub const EMPTY_RESPONSE_NOTICE: &str =
    "Sorry, I was not able to produce a response this time. Please try asking again.";

/// Sender value of messages written by the human.
pub const USER_SENDER: &str = "USER";

/// Upstream chat completions endpoint (OpenAI-compatible).
pub const OPENROUTER_CHAT_COMPLETIONS: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/// Reserved tool names the client reacts to.
pub const TOOL_GET_USER_LOCATION: &str = "get_user_location";
pub const TOOL_TURN_PRIVACY_ON: &str = "turn_privacy_on";
pub const TOOL_REQUEST_WALLET_RECORD: &str = "request_wallet_record";
pub const TEAM_CHAT_TOOL_PREFIX: &str = "team_chat_";
pub const PROJECT_TOOL_PREFIX: &str = "project_";

/// Browser geolocation requests give up after this long.
pub const GEOLOCATION_TIMEOUT_SECS: u64 = 15;

/// Headers
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const SERVER_VERSION_HEADER: &str = "x-server-version";

/// Database defaults
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];

/// Version advertised to clients in `x-server-version`.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
