//! # mcp-conduit
//!
//! Server-side implementation of the Model Context Protocol (MCP) over
//! streamable HTTP, built to scale horizontally: every JSON-RPC message is
//! routed through a pub/sub [`broker`] keyed by session, so any node
//! subscribed to the right subject can carry a response back to the client
//! that is waiting on it.
//!
//! The crate has two load-bearing pieces:
//!
//! * [`transport::StreamableHttpTransport`] — one HTTP endpoint multiplexing
//!   client POSTs, the server-to-client background SSE stream (GET), and
//!   session termination (DELETE), with per-request selection between a
//!   buffered JSON response and an SSE stream.
//! * [`service::Protocol`] — a transport-agnostic JSON-RPC engine that
//!   correlates requests and responses by `(connection, session, request-id)`,
//!   dispatches to handlers registered through [`service::Feature`]s, and
//!   handles cancellation, progress, and timeouts.
//!
//! Everything else is a pluggable collaborator: the [`broker::Broker`]
//! backend, the [`session::SessionStore`], the id generator, and the optional
//! message validator.

pub mod broker;
mod error;
pub mod model;
pub mod service;
pub mod session;
pub mod transport;

pub use error::{ProtocolError, ServiceError, SessionError, TransportError};
pub use model::{ErrorCode, ErrorData, JsonRpcMessage, RequestId};
pub use service::{Feature, FeatureContext, Hooks, Peer, Protocol, ProtocolOptions, handler_fn};
pub use session::{Session, SessionContext, SessionId, SessionStore};
pub use transport::{SendRoute, Transport};
