//! Header names and MIME types used by the streamable HTTP transport.

pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
pub const HEADER_LAST_EVENT_ID: &str = "Last-Event-ID";

pub const JSON_MIME_TYPE: &str = "application/json";
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
