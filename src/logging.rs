use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info, info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use crate::constants::{REQUEST_ID_HEADER, SERVER_VERSION, SERVER_VERSION_HEADER};

const DEFAULT_FILTER: &str = "agents_server=debug,tower_http=info";

/// Installs the global subscriber: stderr, a daily rolling file and an NDJSON trace
/// buffer. Keep the returned guards alive for the lifetime of the process.
pub fn init_tracing(log_dir: &str) -> Vec<WorkerGuard> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_FILTER.into(),
    };

    ensure_log_dir(log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, "agents-server.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let trace_appender = tracing_appender::rolling::daily(log_dir, "trace_buffer.json");
    let (trace_writer, trace_guard) = tracing_appender::non_blocking(trace_appender);

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(trace_writer),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init();

    if let Err(e) = result {
        eprintln!("Tracing already initialized: {}", e);
    }

    vec![file_guard, trace_guard]
}

/// Creates the log directory. A failure is reported on stderr, since the
/// subscriber is not installed yet and the file appenders will not write.
fn ensure_log_dir(log_dir: &str) -> bool {
    match std::fs::create_dir_all(log_dir) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Failed to create log directory {}: {}", log_dir, e);
            false
        }
    }
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = match panic_info.location() {
            Some(l) => format!("{}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every request with an id (reusing the caller's `x-request-id` when sent)
/// and advertises the server version on the way out.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = match req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
    {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => Uuid::new_v4().to_string(),
    };
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    if let Ok(val) = SERVER_VERSION.parse() {
        response.headers_mut().insert(SERVER_VERSION_HEADER, val);
    }
    response
}

/// Per-turn counters of what went out on the wire.
#[derive(Default)]
pub struct StreamMetric {
    text_chunks: AtomicUsize,
    text_chars: AtomicUsize,
    tool_call_frames: AtomicUsize,
    tool_call_frames_deduplicated: AtomicUsize,
    keep_alives: AtomicUsize,
    emulated_increments: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamMetricSnapshot {
    pub text_chunks: usize,
    pub text_chars: usize,
    pub tool_call_frames: usize,
    pub tool_call_frames_deduplicated: usize,
    pub keep_alives: usize,
    pub emulated_increments: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_text(&self, chunk: &str) {
        self.text_chunks.fetch_add(1, Ordering::Relaxed);
        self.text_chars
            .fetch_add(chunk.chars().count(), Ordering::Relaxed);
    }

    pub fn record_tool_calls_frame(&self) {
        self.tool_call_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tool_calls_deduplicated(&self) {
        self.tool_call_frames_deduplicated
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_keep_alive(&self) {
        self.keep_alives.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emulated_increment(&self) {
        self.emulated_increments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamMetricSnapshot {
        StreamMetricSnapshot {
            text_chunks: self.text_chunks.load(Ordering::Relaxed),
            text_chars: self.text_chars.load(Ordering::Relaxed),
            tool_call_frames: self.tool_call_frames.load(Ordering::Relaxed),
            tool_call_frames_deduplicated: self
                .tool_call_frames_deduplicated
                .load(Ordering::Relaxed),
            keep_alives: self.keep_alives.load(Ordering::Relaxed),
            emulated_increments: self.emulated_increments.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self, outcome: &str) {
        let s = self.snapshot();
        info!(
            target: "flight_recorder",
            "[STREAM END] {} | Text: {} chunks / {} chars | ToolCall frames: {} (+{} deduplicated) | Keep-alives: {} | Emulated: {}",
            outcome,
            s.text_chunks,
            s.text_chars,
            s.tool_call_frames,
            s.tool_call_frames_deduplicated,
            s.keep_alives,
            s.emulated_increments
        );
    }
}
