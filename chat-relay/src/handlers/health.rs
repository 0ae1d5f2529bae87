use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

pub const SERVICE_NAME: &str = "chat-relay";

pub async fn index() -> &'static str {
    "AI Chat Backend is running!"
}

/// Liveness probe. Does not touch the provider.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness probe: the provider must accept our credential and model.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    match state.relay.health_check().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Provider readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
