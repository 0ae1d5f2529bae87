//! Application startup and lifecycle management.

use crate::config::{HttpConfig, RelayConfig};
use crate::handlers::{chat, health};
use crate::services::providers::gemini::{GeminiConfig, GeminiTextProvider};
use crate::services::providers::TextProvider;
use crate::services::ChatRelay;
use axum::{
    http::{header, HeaderName, HeaderValue, Method, Request},
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::tracing::{request_id_middleware, REQUEST_ID_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub relay: ChatRelay,
}

impl AppState {
    pub fn new(relay: ChatRelay) -> Self {
        Self { relay }
    }
}

fn cors_layer(http: &HttpConfig) -> Result<CorsLayer, AppError> {
    let origin = match http.cors_origin.as_deref().map(str::trim) {
        None | Some("*") => AllowOrigin::any(),
        // Only a matching request origin is echoed back.
        Some(origin) => AllowOrigin::list([HeaderValue::from_str(origin).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Invalid CORS origin '{}': {}", origin, e))
        })?]),
    };

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)]))
}

/// Build the HTTP router. Routes and layers only; no listener.
pub fn build_router(state: AppState, http: &HttpConfig) -> Result<Router, AppError> {
    let mut router = Router::new()
        .route("/", get(health::index))
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/api/chat", post(chat::chat))
        .route("/api/chat-stream", post(chat::chat_stream));

    if http.diagnostics_routes {
        router = router.route("/api/chat-stream/pending", post(chat::chat_stream_pending));
    }

    let router = router
        .with_state(state)
        // Add tracing layer
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        // Add tracing middleware for request_id
        .layer(from_fn(request_id_middleware))
        .layer(cors_layer(http)?);

    Ok(router)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: RelayConfig) -> Result<Self, AppError> {
        let gemini_config = GeminiConfig {
            api_key: config.google.api_key.clone(),
            model: config.models.text_model.clone(),
            api_base: config.google.api_base.clone(),
            request_timeout: config.upstream.request_timeout,
            idle_timeout: config.upstream.idle_timeout,
        };
        let provider = GeminiTextProvider::new(gemini_config)
            .map_err(|e| AppError::ConfigError(anyhow::Error::new(e)))?;
        let provider: Arc<dyn TextProvider> = Arc::new(provider);

        tracing::info!(
            model = %config.models.text_model,
            "Initialized Gemini text provider"
        );

        Self::with_provider(config, provider).await
    }

    /// Build around an already constructed provider (tests use the mock).
    pub async fn with_provider(
        config: RelayConfig,
        provider: Arc<dyn TextProvider>,
    ) -> Result<Self, AppError> {
        let relay = ChatRelay::new(provider, config.persona.clone());
        let router = build_router(AppState::new(relay), &config.http)?;

        // Port 0 = random port for testing
        let addr: SocketAddr = config.common.socket_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port,
            cors_origin = config.http.cors_origin.as_deref().unwrap_or("*"),
            diagnostics_routes = config.http.diagnostics_routes,
            "Chat relay listening"
        );

        Ok(Self {
            port,
            listener,
            router,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until a shutdown signal arrives.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| {
                tracing::error!("HTTP server error: {}", e);
                e
            })
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
