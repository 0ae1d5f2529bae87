//! End-to-end tests over a real socket.
//!
//! The application is bound to a random port with a scripted provider, so no
//! Gemini credentials or network access are needed.

use chat_relay::config::RelayConfig;
use chat_relay::services::providers::mock::MockTextProvider;
use chat_relay::startup::Application;
use futures::StreamExt;
use reqwest::Client;
use service_core::config::Config;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Spawn the application on a random port and return the port number.
async fn spawn_app(provider: Arc<MockTextProvider>) -> u16 {
    let common = Config {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0, // Random port
    };
    let config = RelayConfig::from_lookup(common, |key| match key {
        "GEMINI_API_KEY" => Some("test-api-key".to_string()),
        "ENVIRONMENT" => Some("test".to_string()),
        _ => None,
    })
    .expect("Failed to load config");

    let app = Application::with_provider(config, provider)
        .await
        .expect("Failed to build application");

    let port = app.port();

    // Spawn the server in the background
    tokio::spawn(async move {
        let _ = app.run_until_stopped().await;
    });

    port
}

#[tokio::test]
async fn health_check_returns_ok() {
    let port = spawn_app(Arc::new(MockTextProvider::replying("ok"))).await;

    let response = Client::new()
        .get(format!("http://127.0.0.1:{}/health", port))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "chat-relay");
}

#[tokio::test]
async fn stream_arrives_incrementally_over_the_wire() {
    let port = spawn_app(Arc::new(MockTextProvider::streaming(["Pa", "ris"]))).await;

    let response = Client::new()
        .post(format!("http://127.0.0.1:{}/api/chat-stream", port))
        .json(&serde_json::json!({ "message": "What is the capital of France?" }))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers()[reqwest::header::CONTENT_TYPE],
        "text/event-stream"
    );

    let mut body = String::new();
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        body.push_str(std::str::from_utf8(&chunk.expect("Failed to read chunk")).unwrap());
    }
    assert_eq!(body, "Pa\n\nris\n\n");
}

#[tokio::test]
async fn broken_stream_terminates_the_connection() {
    let port = spawn_app(Arc::new(MockTextProvider::failing_after(["Pa"], "reset"))).await;

    let response = Client::new()
        .post(format!("http://127.0.0.1:{}/api/chat-stream", port))
        .json(&serde_json::json!({ "message": "hi" }))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), reqwest::StatusCode::OK);

    // The chunked body never reaches its terminating chunk.
    assert!(response.bytes().await.is_err());
}

#[test]
fn refuses_to_start_without_credential() {
    let workdir = std::env::temp_dir();

    let mut child = Command::new(env!("CARGO_BIN_EXE_chat-relay"))
        .current_dir(&workdir)
        .env_remove("GEMINI_API_KEY")
        .env_remove("RUST_LOG")
        .env_remove("OTLP_ENDPOINT")
        .env("ENVIRONMENT", "dev")
        .env("APP__PORT", "0")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn chat-relay");

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().expect("Failed to poll chat-relay") {
            break status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("chat-relay kept running without GEMINI_API_KEY");
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    assert!(!status.success());

    let mut stderr = String::new();
    child
        .stderr
        .take()
        .expect("stderr was not captured")
        .read_to_string(&mut stderr)
        .expect("Failed to read stderr");
    assert!(
        stderr.contains("GEMINI_API_KEY"),
        "unexpected startup failure: {}",
        stderr
    );
}
