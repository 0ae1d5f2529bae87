use chat_relay::config::RelayConfig;
use chat_relay::handlers::health::SERVICE_NAME;
use chat_relay::startup::Application;
use service_core::observability::init_tracing;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    let otlp_endpoint = std::env::var("OTLP_ENDPOINT")
        .ok()
        .filter(|e| !e.is_empty());
    init_tracing(SERVICE_NAME, "info", otlp_endpoint.as_deref());

    // Refuse to start without a usable configuration (notably GEMINI_API_KEY).
    let config = RelayConfig::load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    let application = Application::build(config).await.map_err(|e| {
        tracing::error!("Failed to build application: {}", e);
        std::io::Error::other(format!("Startup error: {}", e))
    })?;

    application.run_until_stopped().await
}
