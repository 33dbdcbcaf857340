use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use clap::Parser;
use mcp_conduit::{
    Hooks, Protocol, ProtocolOptions,
    broker::memory::MemoryBroker,
    session::{SessionStore, memory::MemorySessionStore},
    transport::{
        HttpServerConfig, StreamableHttpConfig, StreamableHttpServer, StreamableHttpTransport,
    },
};
use tracing::info;

mod features;

#[derive(Debug, Parser)]
#[command(name = "mcp-example-server", version, about = "Example MCP server on mcp-conduit")]
struct Args {
    /// Port to listen on.
    #[arg(long, env = "MCP_PORT", default_value_t = 3000)]
    port: u16,

    /// Host to bind.
    #[arg(long, env = "MCP_HOST", default_value = "0.0.0.0")]
    host: String,

    /// MCP endpoint path.
    #[arg(long, env = "MCP_ENDPOINT", default_value = "/mcp")]
    endpoint: String,

    /// JSON-mode response wait ceiling in milliseconds.
    #[arg(long, env = "MCP_RESPONSE_TIMEOUT_MS", default_value_t = 30_000)]
    response_timeout_ms: u64,

    /// Run without a session store: a fresh session id per POST, no state
    /// across requests.
    #[arg(long, env = "MCP_STATELESS")]
    stateless: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hyper=warn".into()),
        )
        .init();

    let args = Args::parse();

    let broker = Arc::new(MemoryBroker::new());
    let session_store: Option<Arc<dyn SessionStore>> = if args.stateless {
        None
    } else {
        Some(Arc::new(MemorySessionStore::new()))
    };
    let transport = StreamableHttpTransport::new(
        broker,
        session_store,
        StreamableHttpConfig {
            response_timeout: Duration::from_millis(args.response_timeout_ms),
            ..StreamableHttpConfig::default()
        },
    );

    let protocol = Protocol::new(ProtocolOptions {
        hooks: Hooks::new().on_ready(|session_id| {
            info!(%session_id, "session ready");
        }),
        ..ProtocolOptions::default()
    });
    features::install_all(&protocol)?;
    protocol
        .connect(transport.clone())
        .await
        .context("connect transport")?;

    let server = StreamableHttpServer::serve_with_layers(
        transport,
        HttpServerConfig {
            host: args.host,
            port: args.port,
            endpoint: args.endpoint,
        },
        |router| router.layer(tower_http::trace::TraceLayer::new_for_http()),
    )
    .await
    .context("bind http server")?;
    info!(addr = %server.local_addr, "ready");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    protocol.close().await?;
    Ok(())
}
