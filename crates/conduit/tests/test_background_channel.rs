//! Background channel (GET) and session termination (DELETE) integration
//! tests, including `Last-Event-ID` resumption.

mod common;

use std::time::Duration;

use common::{initialize_session, read_sse_events, spawn_server};
use mcp_conduit::{broker::Broker as _, transport::SendRoute};
use serde_json::{Value, json};

async fn open_background_stream(
    client: &reqwest::Client,
    url: &str,
    session_id: &str,
    last_event_id: Option<&str>,
) -> anyhow::Result<reqwest::Response> {
    let mut request = client
        .get(url)
        .header("Accept", "text/event-stream")
        .header("Mcp-Session-Id", session_id);
    if let Some(last_event_id) = last_event_id {
        request = request.header("Last-Event-ID", last_event_id);
    }
    let response = request.send().await?;
    anyhow::ensure!(response.status() == reqwest::StatusCode::OK);
    Ok(response)
}

#[tokio::test]
async fn test_get_without_session_header_is_400() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();

    let response = client
        .get(server.mcp_url())
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_get_with_unknown_session_is_404() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();

    let response = client
        .get(server.mcp_url())
        .header("Accept", "text/event-stream")
        .header("Mcp-Session-Id", "no-such-session")
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_notification_reaches_background_stream() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &server).await?;

    let response =
        open_background_stream(&client, &server.mcp_url(), &session_id, None).await?;
    assert_eq!(
        response
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|v| v.to_str().ok()),
        Some(session_id.as_str())
    );

    server
        .protocol
        .notify(
            &server.connection,
            "notifications/message",
            Some(json!({"level": "info", "data": "hello"})),
            SendRoute::session(session_id.clone()),
        )
        .await?;

    let events = read_sse_events(response, 1, Duration::from_secs(5)).await;
    assert_eq!(events.len(), 1);
    let data: Value = serde_json::from_str(&events[0].data)?;
    assert_eq!(data["method"], "notifications/message");
    assert_eq!(data["params"]["data"], "hello");
    Ok(())
}

#[tokio::test]
async fn test_server_initiated_request_reaches_background_stream() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &server).await?;

    let response =
        open_background_stream(&client, &server.mcp_url(), &session_id, None).await?;

    // Fire a server-initiated request; it rides the background inbound
    // subject. Nobody will answer it, so ignore the pending future.
    let protocol = server.protocol.clone();
    let connection = server.connection.clone();
    let route = SendRoute::session(session_id.clone());
    tokio::spawn(async move {
        let _ = protocol
            .request(
                &connection,
                "roots/list",
                None,
                mcp_conduit::service::SendOptions {
                    route,
                    timeout: Some(Duration::from_secs(2)),
                    ..mcp_conduit::service::SendOptions::default()
                },
            )
            .await;
    });

    let events = read_sse_events(response, 1, Duration::from_secs(5)).await;
    assert_eq!(events.len(), 1);
    let data: Value = serde_json::from_str(&events[0].data)?;
    assert_eq!(data["method"], "roots/list");
    assert!(data["id"].is_string());
    Ok(())
}

#[tokio::test]
async fn test_background_stream_skips_responses() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &server).await?;

    let response =
        open_background_stream(&client, &server.mcp_url(), &session_id, None).await?;

    // A stray response on the outbound subject is reserved for request
    // correlation and must not surface on the background channel.
    server
        .broker
        .publish(
            &mcp_conduit::broker::subject::background_outbound(&session_id),
            &mcp_conduit::JsonRpcMessage::response(1u64.into(), json!({})),
        )
        .await?;
    server
        .protocol
        .notify(
            &server.connection,
            "notifications/message",
            Some(json!({"data": "after"})),
            SendRoute::session(session_id.clone()),
        )
        .await?;

    let events = read_sse_events(response, 1, Duration::from_secs(5)).await;
    assert_eq!(events.len(), 1);
    let data: Value = serde_json::from_str(&events[0].data)?;
    assert_eq!(data["params"]["data"], "after");
    Ok(())
}

#[tokio::test]
async fn test_resume_from_last_event_id() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &server).await?;

    let first = open_background_stream(&client, &server.mcp_url(), &session_id, None).await?;

    for n in [10u64, 11, 12] {
        server
            .protocol
            .notify(
                &server.connection,
                "notifications/message",
                Some(json!({"n": n})),
                SendRoute::session(session_id.clone()),
            )
            .await?;
    }

    // The client drops after the first event.
    let events = read_sse_events(first, 1, Duration::from_secs(5)).await;
    assert_eq!(events.len(), 1);
    let first_data: Value = serde_json::from_str(&events[0].data)?;
    assert_eq!(first_data["params"]["n"], 10);
    let last_event_id = events[0].id.clone().expect("event id present");

    // Reopen with Last-Event-ID: only the missed events replay, in order.
    let resumed = open_background_stream(
        &client,
        &server.mcp_url(),
        &session_id,
        Some(&last_event_id),
    )
    .await?;
    let events = read_sse_events(resumed, 2, Duration::from_secs(5)).await;
    assert_eq!(events.len(), 2);
    let n1: Value = serde_json::from_str(&events[0].data)?;
    let n2: Value = serde_json::from_str(&events[1].data)?;
    assert_eq!(n1["params"]["n"], 11);
    assert_eq!(n2["params"]["n"], 12);

    let id1: u64 = events[0].id.as_deref().unwrap().parse()?;
    let id2: u64 = events[1].id.as_deref().unwrap().parse()?;
    let resumed_from: u64 = last_event_id.parse()?;
    assert!(resumed_from < id1 && id1 < id2);
    Ok(())
}

#[tokio::test]
async fn test_delete_is_idempotent_and_terminates_session() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();
    let session_id = initialize_session(&client, &server).await?;

    for _ in 0..2 {
        let response = client
            .delete(server.mcp_url())
            .header("Mcp-Session-Id", &session_id)
            .send()
            .await?;
        assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
    }

    // The session is gone for every subsequent role.
    let response = client
        .post(server.mcp_url())
        .header("Accept", "application/json")
        .header("Mcp-Session-Id", &session_id)
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = client
        .get(server.mcp_url())
        .header("Accept", "text/event-stream")
        .header("Mcp-Session-Id", &session_id)
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_delete_without_session_header_is_400() -> anyhow::Result<()> {
    let server = spawn_server().await?;
    let client = reqwest::Client::new();

    let response = client.delete(server.mcp_url()).send().await?;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    Ok(())
}
