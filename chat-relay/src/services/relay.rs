//! The relay between HTTP callers and the generation provider.
//!
//! Buffered calls are a plain request/response. Streaming calls hand back a
//! body stream that writes each fragment as soon as it arrives and owns the
//! cancellation guard for the upstream fetch, so dropping the body (caller
//! disconnect) stops the provider work.

use crate::config::PersonaConfig;
use crate::error::RelayError;
use crate::models::frame_fragment;
use crate::services::providers::{
    GenerationParams, ProviderError, ProviderStream, StreamChunk, TextProvider,
};
use futures::stream::{self, Stream, StreamExt};
use std::io;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, Span};

/// Shared handle used by every request. Cheap to clone.
#[derive(Clone)]
pub struct ChatRelay {
    provider: Arc<dyn TextProvider>,
    persona: Arc<str>,
}

impl ChatRelay {
    pub fn new(provider: Arc<dyn TextProvider>, persona: PersonaConfig) -> Self {
        Self {
            provider,
            persona: Arc::from(persona.system_instruction),
        }
    }

    /// Await the complete answer for `message`.
    pub async fn complete(&self, message: &str) -> Result<String, RelayError> {
        let response = self
            .provider
            .generate(message, &GenerationParams::default())
            .await?;

        tracing::info!(
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            finish_reason = ?response.finish_reason,
            "Buffered answer received"
        );

        Ok(response.text)
    }

    /// Open the upstream fragment sequence with the persona attached.
    ///
    /// An error here means nothing has been sent to the caller yet. The
    /// returned stream yields framed fragments for the response body.
    pub async fn open_stream(
        &self,
        message: &str,
    ) -> Result<impl Stream<Item = Result<String, io::Error>> + Send + 'static, RelayError> {
        let cancel = CancellationToken::new();
        let params = GenerationParams::with_system_instruction(self.persona.as_ref());

        let fragments = self
            .provider
            .generate_stream(message, &params, cancel.clone())
            .await?;

        Ok(relay_fragments(fragments, cancel.drop_guard()))
    }

    /// Consume a stream server-side, logging each fragment. Returns the fragment count.
    pub async fn drain(&self, message: &str) -> Result<usize, RelayError> {
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();

        let mut fragments = self
            .provider
            .generate_stream(message, &GenerationParams::default(), cancel)
            .await?;

        let mut count = 0;
        while let Some(chunk) = fragments.next().await {
            match chunk? {
                StreamChunk::Text(text) => {
                    count += 1;
                    tracing::info!(fragment = %text, "Received fragment");
                }
                StreamChunk::Complete { .. } => {}
            }
        }

        Ok(count)
    }

    pub async fn health_check(&self) -> Result<(), ProviderError> {
        self.provider.health_check().await
    }
}

/// Where a committed streaming response stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayPhase {
    Emitting,
    Failed,
    Closed,
}

struct FragmentRelay {
    fragments: ProviderStream,
    phase: RelayPhase,
    emitted: usize,
    span: Span,
    _cancel_on_drop: DropGuard,
}

impl FragmentRelay {
    async fn next_frame(&mut self) -> Option<Result<String, io::Error>> {
        if self.phase != RelayPhase::Emitting {
            return None;
        }

        loop {
            match self.fragments.next().await {
                Some(Ok(StreamChunk::Text(text))) => {
                    self.emitted += 1;
                    return Some(Ok(frame_fragment(&text)));
                }
                Some(Ok(StreamChunk::Complete {
                    input_tokens,
                    output_tokens,
                    finish_reason,
                })) => {
                    tracing::info!(
                        input_tokens,
                        output_tokens,
                        finish_reason = ?finish_reason,
                        "Upstream stream completed"
                    );
                }
                Some(Err(e)) => {
                    // Status and headers are already on the wire; the only
                    // signal left is to cut the connection.
                    self.phase = RelayPhase::Failed;
                    tracing::error!(
                        fragments = self.emitted,
                        error = %e,
                        "Upstream failed mid-stream, aborting response"
                    );
                    return Some(Err(io::Error::other("upstream stream failed")));
                }
                None => {
                    self.phase = RelayPhase::Closed;
                    tracing::info!(fragments = self.emitted, "Stream relayed");
                    return None;
                }
            }
        }
    }
}

/// Turn provider chunks into framed body chunks.
///
/// Each fragment is yielded as soon as it arrives. A provider error yields a
/// single `Err` and ends the stream. Dropping the stream cancels the upstream.
pub fn relay_fragments(
    fragments: ProviderStream,
    cancel_on_drop: DropGuard,
) -> impl Stream<Item = Result<String, io::Error>> + Send + 'static {
    let relay = FragmentRelay {
        fragments,
        phase: RelayPhase::Emitting,
        emitted: 0,
        span: Span::current(),
        _cancel_on_drop: cancel_on_drop,
    };

    stream::unfold(relay, |mut relay| async move {
        let span = relay.span.clone();
        let frame = relay.next_frame().instrument(span).await;
        frame.map(|frame| (frame, relay))
    })
}
