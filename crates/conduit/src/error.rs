//! Internal error taxonomy. Everything user-visible is eventually flattened
//! into a JSON-RPC [`ErrorData`] envelope; these enums exist so callers can
//! match on what actually went wrong before that flattening happens.

use std::{borrow::Cow, time::Duration};

use thiserror::Error;

use crate::{
    model::{ErrorData, RequestId},
    session::SessionId,
};

/// Errors raised by a transport while sending or managing its lifecycle.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport configuration error: {0}")]
    Config(Cow<'static, str>),

    #[error("broker error: {0}")]
    Broker(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn broker(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        TransportError::Broker(Box::new(error))
    }
}

/// Errors raised by a session store.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("session expired: {0}")]
    Expired(SessionId),

    #[error("session store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<SessionError> for ErrorData {
    // A bad session id is effectively a bad parameter.
    fn from(error: SessionError) -> Self {
        ErrorData::invalid_params(error.to_string())
    }
}

/// Errors surfaced by the protocol engine to callers of `send`/`request`.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("request {request_id} timed out after {timeout:?}")]
    Timeout {
        request_id: RequestId,
        session_id: Option<SessionId>,
        timeout: Duration,
    },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("aborted by external signal")]
    Aborted,

    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("peer answered with an error: {0}")]
    ErrorResponse(ErrorData),

    #[error("message is a notification; no response will arrive")]
    NotARequest,

    #[error("client does not support capability {0}")]
    MissingCapability(String),
}

impl From<ServiceError> for ErrorData {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::ErrorResponse(data) => data,
            ServiceError::Timeout { .. } => ErrorData::internal_error("Request timeout"),
            other => ErrorData::internal_error(other.to_string()),
        }
    }
}

/// Errors raised while assembling the engine: feature installation and
/// connection management.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("a handler is already registered for method {0}")]
    DuplicateHandler(String),

    #[error("feature initialization failed: {0}")]
    FeatureInit(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ErrorCode;

    #[test]
    fn test_timeout_flattens_to_request_timeout_envelope() {
        let error = ServiceError::Timeout {
            request_id: 3u64.into(),
            session_id: None,
            timeout: Duration::from_secs(30),
        };
        let data: ErrorData = error.into();
        assert_eq!(data.code, ErrorCode::INTERNAL_ERROR);
        assert_eq!(data.message, "Request timeout");
    }

    #[test]
    fn test_error_response_passes_through() {
        let original = ErrorData::method_not_found("tools/call");
        let data: ErrorData = ServiceError::ErrorResponse(original.clone()).into();
        assert_eq!(data, original);
    }

    #[test]
    fn test_session_errors_are_invalid_params() {
        let data: ErrorData = SessionError::NotFound("s1".into()).into();
        assert_eq!(data.code, ErrorCode::INVALID_PARAMS);
    }
}
