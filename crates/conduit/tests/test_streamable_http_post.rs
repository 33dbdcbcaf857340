//! POST-path integration tests: handshake, response modes, batches, timeouts,
//! and malformed input.

mod common;

use std::{sync::atomic::Ordering, time::Duration};

use common::{
    LATEST_PROTOCOL_VERSION, SERVER_NAME, SERVER_VERSION, initialize_session, read_sse_events,
    spawn_server, spawn_server_with,
};
use mcp_conduit::transport::StreamableHttpConfig;
use serde_json::{Value, json};

#[tokio::test]
async fn test_initialize_handshake_json_mode() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();

    let response = client
        .post(server.mcp_url())
        .header("Accept", "application/json")
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": LATEST_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "c", "version": "1"}
            }
        }))
        .send()
        .await?;

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.headers().contains_key("Mcp-Session-Id"));

    let body: Value = response.json().await?;
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["protocolVersion"], LATEST_PROTOCOL_VERSION);
    assert_eq!(body["result"]["capabilities"], json!({}));
    assert_eq!(body["result"]["serverInfo"]["name"], SERVER_NAME);
    assert_eq!(body["result"]["serverInfo"]["version"], SERVER_VERSION);
    Ok(())
}

#[tokio::test]
async fn test_unsupported_protocol_version_falls_back() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();

    let response = client
        .post(server.mcp_url())
        .header("Accept", "application/json")
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2020-01-01",
                "capabilities": {},
                "clientInfo": {"name": "c", "version": "1"}
            }
        }))
        .send()
        .await?;

    let body: Value = response.json().await?;
    // Negotiation falls back to the newest supported version, not an error.
    assert_eq!(body["result"]["protocolVersion"], LATEST_PROTOCOL_VERSION);
    Ok(())
}

#[tokio::test]
async fn test_initialized_notification_is_accepted_and_fires_on_ready_once()
-> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &server).await?;

    for _ in 0..2 {
        let response = client
            .post(server.mcp_url())
            .header("Accept", "application/json")
            .header("Mcp-Session-Id", &session_id)
            .json(&json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized",
                "params": {}
            }))
            .send()
            .await?;
        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
        assert!(response.bytes().await?.is_empty());
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.ready_count.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_tool_call_requires_sse_in_accept() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &server).await?;

    // The default policy picks SSE for tools/call; a JSON-only Accept cannot
    // take that response.
    let response = client
        .post(server.mcp_url())
        .header("Accept", "application/json")
        .header("Mcp-Session-Id", &session_id)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"text": "hi"}}
        }))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_ACCEPTABLE);
    Ok(())
}

#[tokio::test]
async fn test_tool_call_streams_over_sse() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &server).await?;

    let response = client
        .post(server.mcp_url())
        .header("Accept", "*/*")
        .header("Mcp-Session-Id", &session_id)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"text": "hi"}}
        }))
        .send()
        .await?;

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"))
    );

    let events = read_sse_events(response, 1, Duration::from_secs(5)).await;
    assert_eq!(events.len(), 1);
    assert!(events[0].id.is_some(), "events carry the broker event id");
    assert_eq!(events[0].event.as_deref(), Some("message"));
    let data: Value = serde_json::from_str(&events[0].data)?;
    assert_eq!(data["id"], 2);
    assert_eq!(data["result"]["content"][0]["text"], "hi");
    Ok(())
}

#[tokio::test]
async fn test_batch_of_notifications_returns_202() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &server).await?;

    let response = client
        .post(server.mcp_url())
        .header("Accept", "application/json")
        .header("Mcp-Session-Id", &session_id)
        .json(&json!([
            {"jsonrpc": "2.0", "method": "notifications/progress",
             "params": {"progressToken": "t", "progress": 0.5}}
        ]))
        .send()
        .await?;

    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    assert!(response.bytes().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_batch_of_requests_returns_json_array() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &server).await?;

    let response = client
        .post(server.mcp_url())
        .header("Accept", "application/json")
        .header("Mcp-Session-Id", &session_id)
        .json(&json!([
            {"jsonrpc": "2.0", "id": 10, "method": "ping"},
            {"jsonrpc": "2.0", "id": 11, "method": "ping"}
        ]))
        .send()
        .await?;

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await?;
    let responses = body.as_array().expect("batch answers with an array");
    assert_eq!(responses.len(), 2);
    let mut ids: Vec<i64> = responses
        .iter()
        .map(|r| r["id"].as_i64().expect("id echoed"))
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![10, 11]);
    Ok(())
}

#[tokio::test]
async fn test_json_mode_timeout_materializes_error_envelope() -> anyhow::Result<()> {
    let server = spawn_server_with(StreamableHttpConfig {
        response_timeout: Duration::from_millis(400),
        ..StreamableHttpConfig::default()
    })
    .await?;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &server).await?;

    let started = std::time::Instant::now();
    let response = client
        .post(server.mcp_url())
        .header("Accept", "application/json")
        .header("Mcp-Session-Id", &session_id)
        .json(&json!({"jsonrpc": "2.0", "id": 5, "method": "debug/hang"}))
        .send()
        .await?;

    assert!(started.elapsed() >= Duration::from_millis(350));
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body["id"], 5);
    assert_eq!(body["error"]["code"], -32603);
    assert_eq!(body["error"]["message"], "Request timeout");
    Ok(())
}

#[tokio::test]
async fn test_empty_batch_is_rejected() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();

    let response = client
        .post(server.mcp_url())
        .header("Accept", "application/json")
        .header("Content-Type", "application/json")
        .body("[]")
        .send()
        .await?;

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_parse_error_returns_envelope_with_null_id() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();

    let response = client
        .post(server.mcp_url())
        .header("Accept", "application/json")
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await?;

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await?;
    assert!(body["id"].is_null());
    assert_eq!(body["error"]["code"], -32700);
    Ok(())
}

#[tokio::test]
async fn test_accept_without_supported_types_is_rejected() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();

    let response = client
        .post(server.mcp_url())
        .header("Accept", "text/html")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_ACCEPTABLE);
    Ok(())
}

#[tokio::test]
async fn test_post_with_unknown_session_is_404() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();

    let response = client
        .post(server.mcp_url())
        .header("Accept", "application/json")
        .header("Mcp-Session-Id", "no-such-session")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_session_id_via_query_parameter() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &server).await?;

    let response = client
        .post(format!("{}?sessionId={}", server.mcp_url(), session_id))
        .header("Accept", "application/json")
        .json(&json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await?;
    assert_eq!(body["id"], 3);
    assert_eq!(body["result"], json!({}));
    Ok(())
}

#[tokio::test]
async fn test_post_cleans_up_correlation_subscriptions() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &server).await?;

    for _ in 0..3 {
        client
            .post(server.mcp_url())
            .header("Accept", "application/json")
            .header("Mcp-Session-Id", &session_id)
            .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .send()
            .await?;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.transport.active_subscription_count(), 0);
    Ok(())
}
