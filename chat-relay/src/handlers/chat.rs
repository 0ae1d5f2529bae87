use crate::error::RelayError;
use crate::models::{ChatRequest, ChatResponse};
use crate::startup::AppState;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{instrument, Span};

/// Unwrap the JSON body and validate it. Nothing upstream is touched on failure.
fn read_message(payload: Result<Json<ChatRequest>, JsonRejection>) -> Result<String, RelayError> {
    let Json(request) =
        payload.map_err(|rejection| RelayError::MalformedBody(rejection.body_text()))?;
    let message = request.into_message()?;
    Span::current().record("prompt_len", message.len());
    Ok(message)
}

/// `POST /api/chat`: wait for the whole answer and return it as JSON.
#[instrument(skip_all, fields(route = "chat", prompt_len))]
pub async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, RelayError> {
    let message = read_message(payload)?;
    let response = state.relay.complete(&message).await?;

    Ok(Json(ChatResponse { response }))
}

/// `POST /api/chat-stream`: write fragments to the caller as they arrive.
///
/// Validation and the upstream open happen before the status line is
/// committed, so those failures still get a JSON error response. Anything
/// after that aborts the body.
#[instrument(skip_all, fields(route = "chat_stream", prompt_len))]
pub async fn chat_stream(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, RelayError> {
    let message = read_message(payload)?;
    let frames = state.relay.open_stream(&message).await?;

    tracing::info!("Stream opened");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(frames),
    )
        .into_response())
}

/// `POST /api/chat-stream/pending`: diagnostics route that consumes the
/// stream server-side and only reports that it ran.
#[instrument(skip_all, fields(route = "chat_stream_pending", prompt_len))]
pub async fn chat_stream_pending(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, RelayError> {
    let message = read_message(payload)?;
    let fragments = state.relay.drain(&message).await?;

    tracing::info!(fragments, "Stream drained");

    Ok(Json(ChatResponse {
        response: "working".to_string(),
    }))
}
