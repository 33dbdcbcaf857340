//! The seam between the protocol engine and whatever carries messages.
//!
//! A [`Transport`] is object safe: the engine can drive several transports of
//! different concrete types at once. The crate ships one implementation, the
//! broker-routed streamable HTTP transport in [`streamable_http`].

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::{
    error::TransportError,
    model::{JsonRpcMessage, RequestId},
    session::{SessionContext, SessionId},
};

pub mod http_header;
pub mod streamable_http;

pub use streamable_http::{
    HttpServerConfig, ResponseMode, StreamableHttpConfig, StreamableHttpServer,
    StreamableHttpTransport,
};

/// Where an outgoing message should be published.
#[derive(Debug, Clone, Default)]
pub struct SendRoute {
    pub session_id: Option<SessionId>,
    pub request_id: Option<RequestId>,
}

impl SendRoute {
    /// Session-scoped route: background channel.
    pub fn session(session_id: impl Into<SessionId>) -> Self {
        SendRoute {
            session_id: Some(session_id.into()),
            request_id: None,
        }
    }

    /// Request-scoped route: response correlation.
    pub fn request(session_id: impl Into<SessionId>, request_id: RequestId) -> Self {
        SendRoute {
            session_id: Some(session_id.into()),
            request_id: Some(request_id),
        }
    }
}

/// Per-message context a transport fabricates when delivering to the engine.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Instance tag identifying the delivering transport.
    pub transport_id: String,
    pub session: Option<SessionContext>,
    /// Opaque transport-supplied metadata, forwarded to handlers.
    pub metadata: Option<Value>,
}

/// Callback the engine installs on a transport at connect time.
pub type IncomingHandler =
    Arc<dyn Fn(JsonRpcMessage, MessageContext) -> BoxFuture<'static, ()> + Send + Sync>;

pub trait Transport: Send + Sync + 'static {
    /// Stable tag identifying this transport instance.
    fn instance_id(&self) -> &str;

    /// Install the incoming-message callback and start the transport.
    fn connect(&self, incoming: IncomingHandler) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Stop the transport. The on-close hook of the transport fires exactly
    /// once regardless of how many times this is called.
    fn disconnect(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Emit a message toward the peer along the given route.
    fn send(
        &self,
        message: JsonRpcMessage,
        route: SendRoute,
    ) -> BoxFuture<'_, Result<(), TransportError>>;
}
