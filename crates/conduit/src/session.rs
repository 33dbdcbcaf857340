//! Sessions group the logically related HTTP requests of a single MCP client,
//! starting from the `initialize` handshake. The server assigns each session
//! an opaque id (echoed via the `Mcp-Session-Id` header) and the client sends
//! it back on every subsequent request.
//!
//! The store exposes a session as an id plus an opaque key/value bag; the
//! protocol engine consumes an enriched view ([`SessionContext`]) that
//! projects well-known bag keys lazily instead of materializing typed fields
//! up front.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;

pub mod memory;

pub type SessionId = String;

/// Well-known bag keys written during initialization.
pub mod keys {
    pub const PROTOCOL_VERSION: &str = "protocolVersion";
    pub const CLIENT_INFO: &str = "clientInfo";
    pub const CLIENT_CAPABILITIES: &str = "clientCapabilities";
    pub const SERVER_INFO: &str = "serverInfo";
    pub const SERVER_CAPABILITIES: &str = "serverCapabilities";
}

/// Session lifecycle tag. Transitions only move forward:
/// created → initialized → {expired | deleted}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Initialized,
    Expired,
    Deleted,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Initialized)
                | (Created, Expired)
                | (Created, Deleted)
                | (Initialized, Expired)
                | (Initialized, Deleted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Expired | SessionState::Deleted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    pub values: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Session {
            id,
            state: SessionState::Created,
            values: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
            expired_at: None,
            deleted_at: None,
        }
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.values.get(keys::PROTOCOL_VERSION)?.as_str()
    }

    pub fn client_info(&self) -> Option<&Value> {
        self.values.get(keys::CLIENT_INFO)
    }
}

/// Opaque carrier for the HTTP request headers a store implementation may
/// inspect when binding sessions to cookies, IPs, or tokens. The core never
/// looks inside.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    headers: HeaderMap,
}

impl RequestMetadata {
    pub fn from_headers(headers: HeaderMap) -> Self {
        RequestMetadata { headers }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// CRUD on sessions plus atomic access to the key/value bag.
///
/// Object safe so the transport and [`SessionContext`] can hold
/// `Arc<dyn SessionStore>`.
pub trait SessionStore: Send + Sync + 'static {
    fn create(&self, meta: &RequestMetadata) -> BoxFuture<'_, Result<Session, SessionError>>;

    fn get<'a>(
        &'a self,
        id: &'a SessionId,
        meta: &'a RequestMetadata,
    ) -> BoxFuture<'a, Result<Option<Session>, SessionError>>;

    fn delete<'a>(
        &'a self,
        id: &'a SessionId,
        meta: &'a RequestMetadata,
    ) -> BoxFuture<'a, Result<(), SessionError>>;

    fn get_value<'a>(
        &'a self,
        id: &'a SessionId,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Value>, SessionError>>;

    fn set_value<'a>(
        &'a self,
        id: &'a SessionId,
        key: &'a str,
        value: Value,
    ) -> BoxFuture<'a, Result<(), SessionError>>;

    /// Move the session from created to initialized. Called once the
    /// `initialize` exchange has completed.
    fn mark_initialized<'a>(
        &'a self,
        id: &'a SessionId,
    ) -> BoxFuture<'a, Result<(), SessionError>>;
}

#[derive(Clone)]
enum Backing {
    Store(Arc<dyn SessionStore>),
    /// Stateless mode: an in-memory bag that lives as long as the context.
    Synthetic(Arc<tokio::sync::RwLock<serde_json::Map<String, Value>>>),
}

/// The session view handlers consume: an id plus lazy reads into the bag.
#[derive(Clone)]
pub struct SessionContext {
    id: SessionId,
    backing: Backing,
}

impl SessionContext {
    pub fn stored(id: SessionId, store: Arc<dyn SessionStore>) -> Self {
        SessionContext {
            id,
            backing: Backing::Store(store),
        }
    }

    pub fn synthetic(id: SessionId) -> Self {
        SessionContext {
            id,
            backing: Backing::Synthetic(Arc::new(tokio::sync::RwLock::new(
                serde_json::Map::new(),
            ))),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<Value>, SessionError> {
        match &self.backing {
            Backing::Store(store) => store.get_value(&self.id, key).await,
            Backing::Synthetic(bag) => Ok(bag.read().await.get(key).cloned()),
        }
    }

    pub async fn set_value(&self, key: &str, value: Value) -> Result<(), SessionError> {
        match &self.backing {
            Backing::Store(store) => store.set_value(&self.id, key, value).await,
            Backing::Synthetic(bag) => {
                bag.write().await.insert(key.to_owned(), value);
                Ok(())
            }
        }
    }

    pub async fn mark_initialized(&self) -> Result<(), SessionError> {
        match &self.backing {
            Backing::Store(store) => store.mark_initialized(&self.id).await,
            Backing::Synthetic(_) => Ok(()),
        }
    }

    pub async fn protocol_version(&self) -> Option<String> {
        let value = self.get_value(keys::PROTOCOL_VERSION).await.ok()??;
        value.as_str().map(str::to_owned)
    }

    pub async fn client_info(&self) -> Option<Value> {
        self.get_value(keys::CLIENT_INFO).await.ok()?
    }

    pub async fn client_capabilities(&self) -> Option<Value> {
        self.get_value(keys::CLIENT_CAPABILITIES).await.ok()?
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field(
                "backing",
                match &self.backing {
                    Backing::Store(_) => &"store",
                    Backing::Synthetic(_) => &"synthetic",
                },
            )
            .finish()
    }
}
