//! Generation provider abstraction and implementations.
//!
//! The relay only ever talks to one provider (Gemini); the trait exists so the
//! upstream can be replaced by the scripted [`mock::MockTextProvider`] in tests.

pub mod gemini;
pub mod mock;
pub mod sse;

use async_trait::async_trait;
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

/// Error type for provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Content filtered")]
    ContentFiltered,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Result of a buffered generation.
#[derive(Debug)]
pub struct ProviderResponse {
    /// Concatenated text of the first candidate.
    pub text: String,

    /// Input tokens consumed.
    pub input_tokens: i32,

    /// Output tokens generated.
    pub output_tokens: i32,

    /// Finish reason.
    pub finish_reason: FinishReason,
}

/// Reason why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Complete,
    Length,
    ContentFilter,
}

impl FinishReason {
    /// Map a Gemini `finishReason` value.
    pub fn from_provider(reason: Option<&str>) -> Self {
        match reason {
            Some("STOP") | None => FinishReason::Complete,
            Some("MAX_TOKENS") => FinishReason::Length,
            Some("SAFETY") | Some("RECITATION") | Some("BLOCKLIST") | Some("PROHIBITED_CONTENT") => {
                FinishReason::ContentFilter
            }
            Some(_) => FinishReason::Complete,
        }
    }
}

/// One item of a streamed generation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// A response fragment, in upstream order.
    Text(String),

    /// Final marker with usage stats. Never carries text.
    Complete {
        input_tokens: i32,
        output_tokens: i32,
        finish_reason: FinishReason,
    },
}

/// Type alias for provider streams.
pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Per-call generation parameters.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    /// Opaque system-level instruction passed through to the provider verbatim.
    pub system_instruction: Option<String>,
}

impl GenerationParams {
    pub fn with_system_instruction(instruction: impl Into<String>) -> Self {
        Self {
            system_instruction: Some(instruction.into()),
        }
    }
}

/// Trait for text generation providers (e.g., Gemini).
///
/// Implementations must be safe to share across concurrent requests.
#[async_trait]
pub trait TextProvider: Send + Sync {
    /// Generate a complete text response.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Open a fragment stream.
    ///
    /// Errors returned here happen before any fragment exists. Once the stream
    /// is returned, upstream work stops when `cancel` fires or the stream is
    /// dropped.
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError>;

    /// Health check.
    async fn health_check(&self) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(FinishReason::from_provider(None), FinishReason::Complete);
        assert_eq!(FinishReason::from_provider(Some("STOP")), FinishReason::Complete);
        assert_eq!(FinishReason::from_provider(Some("MAX_TOKENS")), FinishReason::Length);
        assert_eq!(
            FinishReason::from_provider(Some("SAFETY")),
            FinishReason::ContentFilter
        );
        assert_eq!(
            FinishReason::from_provider(Some("FINISH_REASON_UNSPECIFIED")),
            FinishReason::Complete
        );
    }
}
