//! Shared harness for the streamable HTTP integration tests: a full server
//! (in-memory broker + session store + engine + HTTP listener on an ephemeral
//! port) plus a tiny SSE client.
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Context as _;
use futures::StreamExt;
use mcp_conduit::{
    ErrorData, Feature, FeatureContext, Hooks, JsonRpcMessage, Protocol, ProtocolError,
    ProtocolOptions, handler_fn,
    broker::memory::MemoryBroker,
    model::JsonRpcRequest,
    service::ConnectionId,
    session::{keys, memory::MemorySessionStore},
    transport::{
        HttpServerConfig, StreamableHttpConfig, StreamableHttpServer, StreamableHttpTransport,
    },
};
use serde_json::{Value, json};

pub const SERVER_NAME: &str = "mcp-example-server";
pub const SERVER_VERSION: &str = "0.1.0";
pub const LATEST_PROTOCOL_VERSION: &str = "2025-11-25";

pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn as_request(message: &JsonRpcMessage) -> Result<&JsonRpcRequest, ErrorData> {
    match message {
        JsonRpcMessage::Request(request) => Ok(request),
        _ => Err(ErrorData::invalid_request("expected a request")),
    }
}

/// Initialize + echo tool + a request that never completes, enough surface to
/// exercise every transport path.
pub struct TestFeature;

impl Feature for TestFeature {
    fn initialize(&self, ctx: &mut FeatureContext<'_>) -> Result<(), ProtocolError> {
        ctx.register_handler(
            "initialize",
            handler_fn(|message, ctx, _info| async move {
                let request = as_request(&message)?;
                let params = request.params.clone().unwrap_or(Value::Null);
                let client_version = params
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .unwrap_or(LATEST_PROTOCOL_VERSION);
                let negotiated = if client_version == "2025-06-18" || client_version == LATEST_PROTOCOL_VERSION {
                    client_version
                } else {
                    LATEST_PROTOCOL_VERSION
                };
                if let Some(session) = &ctx.session {
                    session
                        .set_value(keys::PROTOCOL_VERSION, json!(negotiated))
                        .await
                        .map_err(ErrorData::from)?;
                }
                Ok(json!({
                    "protocolVersion": negotiated,
                    "capabilities": {},
                    "serverInfo": {"name": SERVER_NAME, "version": SERVER_VERSION},
                }))
            }),
        )?;

        ctx.register_handler(
            "notifications/initialized",
            handler_fn(|_message, ctx, _info| async move {
                if let Some(session) = &ctx.session {
                    session.mark_initialized().await.map_err(ErrorData::from)?;
                }
                Ok(json!({}))
            }),
        )?;

        ctx.register_handler(
            "ping",
            handler_fn(|_message, _ctx, _info| async move { Ok(json!({})) }),
        )?;

        ctx.register_handler(
            "tools/call",
            handler_fn(|message, _ctx, _info| async move {
                let request = as_request(&message)?;
                let params = request.params.clone().unwrap_or(Value::Null);
                match params.get("name").and_then(Value::as_str) {
                    Some("echo") => {
                        let text = params
                            .get("arguments")
                            .and_then(|arguments| arguments.get("text"))
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        Ok(json!({"content": [{"type": "text", "text": text}]}))
                    }
                    other => Err(ErrorData::invalid_params(format!(
                        "unknown tool: {}",
                        other.unwrap_or("<none>")
                    ))),
                }
            }),
        )?;

        // A handler that never resolves, for timeout coverage.
        ctx.register_handler(
            "debug/hang",
            handler_fn(|_message, _ctx, info| async move {
                info.signal.cancelled().await;
                Ok(json!({}))
            }),
        )
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub protocol: Protocol,
    pub connection: ConnectionId,
    pub transport: Arc<StreamableHttpTransport<MemoryBroker>>,
    pub broker: Arc<MemoryBroker>,
    pub ready_count: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn mcp_url(&self) -> String {
        format!("http://{}/mcp", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub async fn spawn_server() -> anyhow::Result<TestServer> {
    spawn_server_with(StreamableHttpConfig::default()).await
}

pub async fn spawn_server_with(config: StreamableHttpConfig) -> anyhow::Result<TestServer> {
    init_tracing();

    let broker = Arc::new(MemoryBroker::new());
    let transport = StreamableHttpTransport::new(
        broker.clone(),
        Some(Arc::new(MemorySessionStore::new())),
        config,
    );

    let ready_count = Arc::new(AtomicUsize::new(0));
    let counter = ready_count.clone();
    let protocol = Protocol::new(ProtocolOptions {
        hooks: Hooks::new().on_ready(move |_session| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        ..ProtocolOptions::default()
    });
    protocol.add_feature(&TestFeature)?;
    let connection = protocol.connect(transport.clone()).await?;

    let server = StreamableHttpServer::serve(
        transport.clone(),
        HttpServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
            endpoint: "/mcp".to_owned(),
        },
    )
    .await?;

    Ok(TestServer {
        addr: server.local_addr,
        protocol,
        connection,
        transport,
        broker,
        ready_count,
    })
}

/// Run the initialize handshake and return the session id.
pub async fn initialize_session(
    client: &reqwest::Client,
    server: &TestServer,
) -> anyhow::Result<String> {
    let response = client
        .post(server.mcp_url())
        .header("Accept", "application/json")
        .header("Content-Type", "application/json")
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
    anyhow::ensure!(response.status() == reqwest::StatusCode::OK);
    let session_id = response
        .headers()
        .get("Mcp-Session-Id")
        .context("missing session header")?
        .to_str()?
        .to_owned();
    Ok(session_id)
}

#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Read up to `count` SSE events (comments skipped) from a streaming
/// response, bounded by `wait`.
pub async fn read_sse_events(
    response: reqwest::Response,
    count: usize,
    wait: Duration,
) -> Vec<SseEvent> {
    let mut events = Vec::new();
    let mut buffer = String::new();
    let mut stream = response.bytes_stream();

    let _ = tokio::time::timeout(wait, async {
        while let Some(chunk) = stream.next().await {
            let Ok(chunk) = chunk else { break };
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(boundary) = buffer.find("\n\n") {
                let block: String = buffer.drain(..boundary + 2).collect();
                if let Some(event) = parse_sse_block(block.trim_end()) {
                    events.push(event);
                    if events.len() >= count {
                        return;
                    }
                }
            }
        }
    })
    .await;

    events
}

fn parse_sse_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut has_data = false;
    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("id: ") {
            event.id = Some(rest.to_owned());
        } else if let Some(rest) = line.strip_prefix("event: ") {
            event.event = Some(rest.to_owned());
        } else if let Some(rest) = line.strip_prefix("data: ") {
            if has_data {
                event.data.push('\n');
            }
            event.data.push_str(rest);
            has_data = true;
        }
    }
    has_data.then_some(event)
}
