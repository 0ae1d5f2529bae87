use crate::services::providers::ProviderError;
use axum::response::{IntoResponse, Response};
use service_core::error::AppError;
use thiserror::Error;

/// Failures a relay request can end with before its response is committed.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid chat request: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("unreadable request body: {0}")]
    MalformedBody(String),

    #[error("upstream failure: {0}")]
    Upstream(#[from] ProviderError),
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Validation(errors) => AppError::ValidationError(errors),
            RelayError::MalformedBody(reason) => AppError::BadRequest(anyhow::anyhow!(reason)),
            RelayError::Upstream(e) => AppError::UpstreamError(anyhow::Error::new(e)),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        AppError::from(self).into_response()
    }
}
