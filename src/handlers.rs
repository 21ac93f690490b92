use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::Instrument;

use crate::constants::{
    REQUEST_ID_HEADER, SERVER_VERSION_HEADER, STREAM_CHANNEL_CAPACITY, USER_ID_HEADER,
};
use crate::frames::ChannelSink;
use crate::health;
use crate::logging::request_id_middleware;
use crate::orchestrator::prepare_turn;
use crate::types::*;
use crate::AppState;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderName::from_static(SERVER_VERSION_HEADER),
        ]);

    Router::new()
        .route(
            "/agents/:agent_name/api/chat",
            post(chat_handler).options(chat_options),
        )
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(DefaultBodyLimit::max(state.max_body_size))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .with_state(state)
}

pub async fn chat_options() -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
        ],
    )
}

fn user_from_headers(headers: &HeaderMap) -> Option<UserId> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| UserId(v.to_string()))
}

/// Public origin of this server as seen by the caller, for agent references.
fn origin_from_headers(headers: &HeaderMap) -> String {
    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        return origin.to_string();
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    format!("{}://{}", scheme, host)
}

/// `POST /agents/:agent_name/api/chat`. Policy and validation failures come back
/// as JSON errors; once the turn is prepared the body streams until the turn ends.
pub async fn chat_handler(
    State(state): State<AppState>,
    Path(agent_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ObservedError> {
    let user = user_from_headers(&headers);
    let origin = origin_from_headers(&headers);
    let turn = prepare_turn(
        state.orchestrator.collaborators(),
        &agent_name,
        &origin,
        user,
        &body,
    )
    .await?;

    let (sink, rx) = ChannelSink::channel(STREAM_CHANNEL_CAPACITY);
    let abort = CancellationToken::new();
    // Dropping the response body (client gone) fires the abort signal.
    let abort_guard = abort.clone().drop_guard();

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(
        async move {
            orchestrator.run(turn, sink, abort).await;
        }
        .in_current_span(),
    );

    let stream = ReceiverStream::new(rx).map(move |item| {
        let _ = &abort_guard;
        item
    });

    let mut response = Body::from_stream(stream).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/markdown; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}
