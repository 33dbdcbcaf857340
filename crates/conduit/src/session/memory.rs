//! In-memory session store.

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{RequestMetadata, Session, SessionId, SessionState, SessionStore};
use crate::error::SessionError;

/// Sessions held in a process-local map. Deleted sessions keep a tombstone so
/// `delete` stays idempotent and late lookups miss cleanly.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<std::collections::HashMap<SessionId, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn create(&self, _meta: &RequestMetadata) -> BoxFuture<'_, Result<Session, SessionError>> {
        Box::pin(async {
            let session = Session::new(Uuid::new_v4().to_string());
            self.sessions
                .write()
                .await
                .insert(session.id.clone(), session.clone());
            tracing::debug!(session_id = %session.id, "session created");
            Ok(session)
        })
    }

    fn get<'a>(
        &'a self,
        id: &'a SessionId,
        _meta: &'a RequestMetadata,
    ) -> BoxFuture<'a, Result<Option<Session>, SessionError>> {
        Box::pin(async move {
            let sessions = self.sessions.read().await;
            Ok(sessions
                .get(id)
                .filter(|session| !session.state.is_terminal())
                .cloned())
        })
    }

    fn delete<'a>(
        &'a self,
        id: &'a SessionId,
        _meta: &'a RequestMetadata,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(id) {
                if session.state.can_transition_to(SessionState::Deleted) {
                    session.state = SessionState::Deleted;
                    let now = chrono::Utc::now();
                    session.deleted_at = Some(now);
                    session.updated_at = now;
                    tracing::debug!(session_id = %id, "session deleted");
                }
            }
            Ok(())
        })
    }

    fn get_value<'a>(
        &'a self,
        id: &'a SessionId,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Value>, SessionError>> {
        Box::pin(async move {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(id)
                .filter(|session| !session.state.is_terminal())
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;
            Ok(session.values.get(key).cloned())
        })
    }

    fn set_value<'a>(
        &'a self,
        id: &'a SessionId,
        key: &'a str,
        value: Value,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(id)
                .filter(|session| !session.state.is_terminal())
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;
            session.values.insert(key.to_owned(), value);
            session.updated_at = chrono::Utc::now();
            Ok(())
        })
    }

    fn mark_initialized<'a>(
        &'a self,
        id: &'a SessionId,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;
            if session.state.can_transition_to(SessionState::Initialized) {
                session.state = SessionState::Initialized;
                session.updated_at = chrono::Utc::now();
            }
            Ok(())
        })
    }
}
