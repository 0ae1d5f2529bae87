//! Scripted provider for tests.
//!
//! Records every call so tests can assert what reached the upstream, and can
//! fail before or in the middle of a stream, or hold a stream open until the
//! caller cancels it.

use super::{
    FinishReason, GenerationParams, ProviderError, ProviderResponse, ProviderStream, StreamChunk,
    TextProvider,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// What the mock does when asked to generate.
#[derive(Debug, Clone)]
enum Script {
    /// Answer with these fragments; the buffered answer is their concatenation.
    Fragments(Vec<String>),
    /// Fail before producing anything.
    Fail(String),
    /// Emit the fragments, then fail.
    FailAfter(Vec<String>, String),
    /// Emit the fragments, then stay silent until cancelled.
    HoldOpen(Vec<String>),
}

/// A call observed by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub prompt: String,
    pub system_instruction: Option<String>,
    pub streaming: bool,
}

/// Mock text provider for testing.
pub struct MockTextProvider {
    script: Script,
    calls: Mutex<Vec<RecordedCall>>,
    tokens: Mutex<Vec<CancellationToken>>,
}

impl MockTextProvider {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }

    /// Always answers with `text` (as a single fragment when streaming).
    pub fn replying(text: impl Into<String>) -> Self {
        Self::with_script(Script::Fragments(vec![text.into()]))
    }

    pub fn streaming<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(Script::Fragments(
            fragments.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_script(Script::Fail(message.into()))
    }

    pub fn failing_after<I, S>(fragments: I, message: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(Script::FailAfter(
            fragments.into_iter().map(Into::into).collect(),
            message.into(),
        ))
    }

    pub fn holding_open<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(Script::HoldOpen(
            fragments.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Cancellation tokens handed to `generate_stream`, in call order.
    pub fn cancellation_tokens(&self) -> Vec<CancellationToken> {
        self.tokens.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn record(&self, prompt: &str, params: &GenerationParams, streaming: bool) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                prompt: prompt.to_string(),
                system_instruction: params.system_instruction.clone(),
                streaming,
            });
        }
    }
}

fn complete(prompt: &str, fragments: usize) -> StreamChunk {
    StreamChunk::Complete {
        input_tokens: prompt.len() as i32 / 4,
        output_tokens: fragments as i32,
        finish_reason: FinishReason::Complete,
    }
}

fn text_chunks(fragments: &[String]) -> Vec<Result<StreamChunk, ProviderError>> {
    fragments
        .iter()
        .map(|f| Ok(StreamChunk::Text(f.clone())))
        .collect()
}

#[async_trait]
impl TextProvider for MockTextProvider {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ProviderResponse, ProviderError> {
        self.record(prompt, params, false);

        match &self.script {
            Script::Fragments(fragments) | Script::HoldOpen(fragments) => Ok(ProviderResponse {
                text: fragments.concat(),
                input_tokens: prompt.len() as i32 / 4,
                output_tokens: fragments.len() as i32,
                finish_reason: FinishReason::Complete,
            }),
            Script::Fail(message) | Script::FailAfter(_, message) => {
                Err(ProviderError::ApiError(message.clone()))
            }
        }
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        self.record(prompt, params, true);
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.push(cancel.clone());
        }

        let stream: ProviderStream = match &self.script {
            Script::Fragments(fragments) => {
                let mut chunks = text_chunks(fragments);
                chunks.push(Ok(complete(prompt, fragments.len())));
                Box::pin(stream::iter(chunks))
            }
            Script::Fail(message) => return Err(ProviderError::ApiError(message.clone())),
            Script::FailAfter(fragments, message) => {
                let mut chunks = text_chunks(fragments);
                chunks.push(Err(ProviderError::NetworkError(message.clone())));
                Box::pin(stream::iter(chunks))
            }
            Script::HoldOpen(fragments) => {
                let tail = stream::once(async move { cancel.cancelled().await })
                    .filter_map(|()| {
                        futures::future::ready(None::<Result<StreamChunk, ProviderError>>)
                    });
                Box::pin(stream::iter(text_chunks(fragments)).chain(tail))
            }
        };

        Ok(stream)
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        match &self.script {
            Script::Fail(message) => Err(ProviderError::NotConfigured(message.clone())),
            _ => Ok(()),
        }
    }
}
