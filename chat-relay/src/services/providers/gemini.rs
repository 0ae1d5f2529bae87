//! Gemini AI provider implementation.
//!
//! Implements text generation using Google's Gemini API.
//! Supports both streaming and non-streaming responses.

use super::sse::SseDecoder;
use super::{
    FinishReason, GenerationParams, ProviderError, ProviderResponse, ProviderStream, StreamChunk,
    TextProvider,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Gemini API base URL.
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Gemini provider configuration.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Secret<String>,
    pub model: String,
    pub api_base: String,
    /// Bound on the buffered call, and on waiting for streaming response headers.
    pub request_timeout: Duration,
    /// Longest silence tolerated between two chunks of a streamed response.
    pub idle_timeout: Duration,
}

/// Gemini text provider.
pub struct GeminiTextProvider {
    config: GeminiConfig,
    client: Client,
}

impl GeminiTextProvider {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        // No client-wide timeout: it would also cap the lifetime of a healthy stream.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                ProviderError::NotConfigured(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { config, client })
    }

    /// Build the API URL for the given model and method.
    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.model,
            method
        )
    }

    fn build_request(&self, prompt: &str, params: &GenerationParams) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![ContentPart {
                    text: prompt.to_string(),
                }],
            }],
            system_instruction: params.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![ContentPart { text: text.clone() }],
            }),
        }
    }

    async fn post(&self, url: &str, request: &GenerateContentRequest) -> Result<Response, ProviderError> {
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, self.config.api_key.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.config.request_timeout)
                } else {
                    ProviderError::NetworkError(e.to_string())
                }
            })?;

        ensure_success(response).await
    }
}

async fn ensure_success(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited);
    }

    let error_text = response.text().await.unwrap_or_default();
    Err(ProviderError::ApiError(format!(
        "Gemini API error {}: {}",
        status, error_text
    )))
}

#[async_trait]
impl TextProvider for GeminiTextProvider {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ProviderResponse, ProviderError> {
        let request = self.build_request(prompt, params);
        let url = self.api_url("generateContent");

        tracing::debug!(
            model = %self.config.model,
            prompt_len = prompt.len(),
            "Sending request to Gemini API"
        );

        let call = async {
            let response = self.post(&url, &request).await?;
            response
                .json::<GenerateContentResponse>()
                .await
                .map_err(|e| ProviderError::ApiError(format!("Failed to parse response: {}", e)))
        };

        let mut api_response = tokio::time::timeout(self.config.request_timeout, call)
            .await
            .map_err(|_| ProviderError::Timeout(self.config.request_timeout))??;

        if let Some(error) = api_response.error.take() {
            return Err(error.into());
        }

        let finish_reason = FinishReason::from_provider(api_response.finish_reason());
        if finish_reason == FinishReason::ContentFilter {
            return Err(ProviderError::ContentFiltered);
        }

        let usage = api_response.usage_metadata.clone().unwrap_or_default();

        Ok(ProviderResponse {
            text: api_response.text(),
            input_tokens: usage.prompt_token_count.unwrap_or(0),
            output_tokens: usage.candidates_token_count.unwrap_or(0),
            finish_reason,
        })
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        let request = self.build_request(prompt, params);
        let url = format!("{}?alt=sse", self.api_url("streamGenerateContent"));

        tracing::debug!(
            model = %self.config.model,
            prompt_len = prompt.len(),
            has_system_instruction = params.system_instruction.is_some(),
            "Starting streaming request to Gemini API"
        );

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProviderError::NetworkError("request cancelled by caller".to_string()));
            }
            result = tokio::time::timeout(self.config.request_timeout, self.post(&url, &request)) => {
                result.map_err(|_| ProviderError::Timeout(self.config.request_timeout))??
            }
        };

        // Create channel for streaming
        let (tx, rx) = mpsc::channel(32);
        let idle_timeout = self.config.idle_timeout;

        tokio::spawn(pump_events(response, tx, cancel, idle_timeout));

        let stream = ReceiverStream::new(rx);
        Ok(Box::pin(stream) as ProviderStream)
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.config.api_key.expose_secret().is_empty() {
            return Err(ProviderError::NotConfigured(
                "Gemini API key not configured".to_string(),
            ));
        }

        // Fetching the configured model verifies both the key and the model id.
        let url = format!(
            "{}/models/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.model
        );

        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, self.config.api_key.expose_secret())
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::ApiError(format!(
                "Health check failed: {}",
                response.status()
            )))
        }
    }
}

/// Read the SSE body and forward fragments until the body ends, an error
/// occurs, the receiver goes away or `cancel` fires.
async fn pump_events(
    response: Response,
    tx: mpsc::Sender<Result<StreamChunk, ProviderError>>,
    cancel: CancellationToken,
    idle_timeout: Duration,
) {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut tracker = UsageTracker::default();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Caller went away, aborting Gemini stream");
                return;
            }
            next = tokio::time::timeout(idle_timeout, body.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                let _ = tx.send(Err(ProviderError::Timeout(idle_timeout))).await;
                return;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                let _ = tx
                    .send(Err(ProviderError::NetworkError(e.to_string())))
                    .await;
                return;
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        for payload in decoder.push(&chunk) {
            if !forward_event(&payload, &mut tracker, &tx).await {
                return;
            }
        }
    }

    if let Some(payload) = decoder.finish() {
        if !forward_event(&payload, &mut tracker, &tx).await {
            return;
        }
    }

    let _ = tx.send(Ok(tracker.complete())).await;
}

/// Returns false when streaming must stop.
async fn forward_event(
    payload: &str,
    tracker: &mut UsageTracker,
    tx: &mpsc::Sender<Result<StreamChunk, ProviderError>>,
) -> bool {
    let mut response = match serde_json::from_str::<GenerateContentResponse>(payload) {
        Ok(response) => response,
        Err(e) => {
            let _ = tx
                .send(Err(ProviderError::ApiError(format!(
                    "Failed to parse stream event: {}",
                    e
                ))))
                .await;
            return false;
        }
    };

    if let Some(error) = response.error.take() {
        let _ = tx.send(Err(error.into())).await;
        return false;
    }

    tracker.observe(&response);

    let text = response.text();
    if text.is_empty() {
        return true;
    }

    tx.send(Ok(StreamChunk::Text(text))).await.is_ok()
}

/// Running token usage and finish reason across stream events.
#[derive(Debug)]
struct UsageTracker {
    input_tokens: i32,
    output_tokens: i32,
    finish_reason: FinishReason,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Complete,
        }
    }
}

impl UsageTracker {
    fn observe(&mut self, response: &GenerateContentResponse) {
        if let Some(usage) = &response.usage_metadata {
            self.input_tokens = usage.prompt_token_count.unwrap_or(self.input_tokens);
            self.output_tokens = usage.candidates_token_count.unwrap_or(self.output_tokens);
        }
        if let Some(reason) = response.finish_reason() {
            self.finish_reason = FinishReason::from_provider(Some(reason));
        }
    }

    fn complete(&self) -> StreamChunk {
        StreamChunk::Complete {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            finish_reason: self.finish_reason,
        }
    }
}

// ============================================================================
// Gemini API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<ContentPart>,
}

/// Only text parts are used; other part kinds deserialize with empty text.
#[derive(Debug, Serialize, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

impl GenerateContentResponse {
    /// All text parts of the first candidate, in order.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| content.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default()
    }

    fn finish_reason(&self) -> Option<&str> {
        self.candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<i32>,
    candidates_token_count: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

impl From<ApiErrorBody> for ProviderError {
    fn from(body: ApiErrorBody) -> Self {
        match body.code {
            Some(429) => ProviderError::RateLimited,
            Some(code) => ProviderError::ApiError(format!("Gemini API error {}: {}", code, body.message)),
            None => ProviderError::ApiError(format!("Gemini API error: {}", body.message)),
        }
    }
}
