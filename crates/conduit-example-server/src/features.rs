//! The example feature set: MCP initialization plus an `echo` tool.

use mcp_conduit::{
    ErrorData, Feature, FeatureContext, JsonRpcMessage, ProtocolError, handler_fn,
    model::JsonRpcRequest,
    session::keys,
};
use serde_json::{Value, json};

/// Protocol revisions this server speaks, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &["2025-11-25", "2025-06-18", "2025-03-26", "2024-11-05"];

pub const SERVER_NAME: &str = "mcp-example-server";
pub const SERVER_VERSION: &str = "0.1.0";

/// Version negotiation: echo a supported client version, otherwise offer the
/// newest one we speak. Unsupported versions are not an error.
pub fn negotiate_protocol_version(client: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|version| **version == client)
        .copied()
        .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0])
}

fn as_request(message: &JsonRpcMessage) -> Result<&JsonRpcRequest, ErrorData> {
    match message {
        JsonRpcMessage::Request(request) => Ok(request),
        _ => Err(ErrorData::invalid_request("expected a request")),
    }
}

/// Handles `initialize`, `notifications/initialized`, and `ping`, and records
/// the negotiated metadata on the session.
pub struct InitializeFeature {
    server_capabilities: Value,
}

impl InitializeFeature {
    pub fn new() -> Self {
        InitializeFeature {
            server_capabilities: json!({}),
        }
    }

    pub fn with_capabilities(server_capabilities: Value) -> Self {
        InitializeFeature {
            server_capabilities,
        }
    }
}

impl Default for InitializeFeature {
    fn default() -> Self {
        Self::new()
    }
}

impl Feature for InitializeFeature {
    fn initialize(&self, ctx: &mut FeatureContext<'_>) -> Result<(), ProtocolError> {
        let server_capabilities = self.server_capabilities.clone();
        ctx.register_handler(
            "initialize",
            handler_fn(move |message, ctx, _info| {
                let server_capabilities = server_capabilities.clone();
                async move {
                    let request = as_request(&message)?;
                    let params = request.params.clone().unwrap_or(Value::Null);
                    let client_version = params
                        .get("protocolVersion")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            ErrorData::invalid_params("protocolVersion is required")
                        })?;
                    let negotiated = negotiate_protocol_version(client_version);

                    if let Some(session) = &ctx.session {
                        session
                            .set_value(keys::PROTOCOL_VERSION, json!(negotiated))
                            .await
                            .map_err(ErrorData::from)?;
                        if let Some(client_info) = params.get("clientInfo") {
                            session
                                .set_value(keys::CLIENT_INFO, client_info.clone())
                                .await
                                .map_err(ErrorData::from)?;
                        }
                        if let Some(capabilities) = params.get("capabilities") {
                            session
                                .set_value(keys::CLIENT_CAPABILITIES, capabilities.clone())
                                .await
                                .map_err(ErrorData::from)?;
                        }
                        session
                            .set_value(
                                keys::SERVER_INFO,
                                json!({"name": SERVER_NAME, "version": SERVER_VERSION}),
                            )
                            .await
                            .map_err(ErrorData::from)?;
                        session
                            .set_value(keys::SERVER_CAPABILITIES, server_capabilities.clone())
                            .await
                            .map_err(ErrorData::from)?;
                    }

                    tracing::info!(
                        client_version,
                        negotiated,
                        "initialize handshake"
                    );
                    Ok(json!({
                        "protocolVersion": negotiated,
                        "capabilities": server_capabilities,
                        "serverInfo": {"name": SERVER_NAME, "version": SERVER_VERSION},
                    }))
                }
            }),
        )?;

        ctx.register_handler(
            "notifications/initialized",
            handler_fn(|_message, ctx, _info| async move {
                if let Some(session) = &ctx.session {
                    session.mark_initialized().await.map_err(ErrorData::from)?;
                    tracing::debug!(session_id = %session.id(), "client confirmed initialization");
                }
                Ok(json!({}))
            }),
        )?;

        ctx.register_handler(
            "ping",
            handler_fn(|_message, _ctx, _info| async move { Ok(json!({})) }),
        )
    }
}

/// One tool, `echo`, which repeats its `text` argument back.
pub struct ToolsFeature;

impl ToolsFeature {
    fn descriptors() -> Value {
        json!([{
            "name": "echo",
            "description": "Echo the provided text back to the caller",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "text": {"type": "string"}
                },
                "required": ["text"]
            }
        }])
    }
}

impl Feature for ToolsFeature {
    fn initialize(&self, ctx: &mut FeatureContext<'_>) -> Result<(), ProtocolError> {
        ctx.register_handler(
            "tools/list",
            handler_fn(|_message, _ctx, _info| async move {
                Ok(json!({"tools": ToolsFeature::descriptors()}))
            }),
        )?;

        ctx.register_handler(
            "tools/call",
            handler_fn(|message, _ctx, _info| async move {
                let request = as_request(&message)?;
                let params = request.params.clone().unwrap_or(Value::Null);
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ErrorData::invalid_params("tool name is required"))?;
                match name {
                    "echo" => {
                        let text = params
                            .get("arguments")
                            .and_then(|arguments| arguments.get("text"))
                            .and_then(Value::as_str)
                            .ok_or_else(|| {
                                ErrorData::invalid_params("echo requires a text argument")
                            })?;
                        Ok(json!({
                            "content": [{"type": "text", "text": text}]
                        }))
                    }
                    other => Err(ErrorData::invalid_params(format!("unknown tool: {other}"))),
                }
            }),
        )
    }
}

/// Convenience: install the whole example feature set.
pub fn install_all(protocol: &mcp_conduit::Protocol) -> Result<(), ProtocolError> {
    protocol.add_feature(&InitializeFeature::new())?;
    protocol.add_feature(&ToolsFeature)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_version_is_echoed() {
        assert_eq!(negotiate_protocol_version("2025-06-18"), "2025-06-18");
    }

    #[test]
    fn test_unsupported_version_falls_back_to_latest() {
        assert_eq!(negotiate_protocol_version("2020-01-01"), "2025-11-25");
    }
}
