//! Deterministic mapping of `(session, request?, direction)` tuples to broker
//! subjects.
//!
//! Three families:
//!
//! * `mcp.{session}.{request}.{inbound|outbound}` — request-scoped, one pair
//!   of subjects per client request.
//! * `mcp.{session}.bg.{inbound|outbound}` — session-scoped background
//!   channel for server-initiated traffic.
//! * `mcp.{session}.>` — everything for a session, debugging only.
//!
//! Subjects are injective in their parameters; the `bg` infix separates the
//! session-scoped family from the request-scoped one.

use std::fmt::Display;

use crate::{model::RequestId, session::SessionId};

const ROOT: &str = "mcp";
const BACKGROUND: &str = "bg";
const INBOUND: &str = "inbound";
const OUTBOUND: &str = "outbound";

/// A broker subject or subscribe pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject(String);

impl Subject {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Subject {
    fn from(value: String) -> Self {
        Subject(value)
    }
}

impl From<&str> for Subject {
    fn from(value: &str) -> Self {
        Subject(value.to_owned())
    }
}

/// Subject carrying one client request into the server.
pub fn request_inbound(session: &SessionId, request: &RequestId) -> Subject {
    Subject(format!("{ROOT}.{session}.{request}.{INBOUND}"))
}

/// Subject carrying the server's response(s) to one client request.
pub fn request_outbound(session: &SessionId, request: &RequestId) -> Subject {
    Subject(format!("{ROOT}.{session}.{request}.{OUTBOUND}"))
}

/// Subject carrying server-initiated requests addressed to the client.
pub fn background_inbound(session: &SessionId) -> Subject {
    Subject(format!("{ROOT}.{session}.{BACKGROUND}.{INBOUND}"))
}

/// Subject carrying server-initiated notifications addressed to the client.
pub fn background_outbound(session: &SessionId) -> Subject {
    Subject(format!("{ROOT}.{session}.{BACKGROUND}.{OUTBOUND}"))
}

/// Pattern matching every subject of a session. Debugging only.
pub fn session_wildcard(session: &SessionId) -> Subject {
    Subject(format!("{ROOT}.{session}.>"))
}

/// Match a subject against a pattern. `*` matches exactly one segment, `>`
/// matches the rest of the subject and is only meaningful as the final
/// pattern segment.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_segments = pattern.split('.');
    let mut subject_segments = subject.split('.');
    loop {
        match (pattern_segments.next(), subject_segments.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
