//! MCP client: runs the handshake and tool calls over any [`RpcTransport`].
//!
//! Handles the protocol handshake (initialize + initialized notification),
//! liveness checks (ping), tool discovery (tools/list), and tool invocation
//! (tools/call).

use std::sync::{Arc, Mutex};

use conduit_types::{
    ClientCapabilities, Implementation, InitializeParams, InitializeResult,
    LATEST_PROTOCOL_VERSION, RpcError, TransportPtr, lock_ignore_poison,
};
use serde::Deserialize;
use serde_json::Value;

use crate::config::McpServerConfig;
use crate::negotiate;
use crate::transport::ChildProcessTransport;

/// Information about a tool exposed by an MCP server.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Result of calling a tool on an MCP server.
#[derive(Debug, Clone)]
pub struct McpToolResult {
    pub content: Vec<McpToolContent>,
    pub is_error: bool,
}

impl McpToolResult {
    /// Concatenated text of every text item.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                McpToolContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A content item in a tool result.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum McpToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    #[serde(other)]
    Unsupported,
}

/// Deserialization helpers for MCP protocol messages.
#[derive(Deserialize)]
struct ToolsListResult {
    tools: Vec<ToolEntry>,
}

#[derive(Deserialize)]
struct ToolEntry {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_schema", rename = "inputSchema")]
    input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[derive(Deserialize)]
struct ToolCallResult {
    content: Vec<McpToolContent>,
    #[serde(default, rename = "isError")]
    is_error: bool,
}

/// Client for a single MCP server.
pub struct McpClient {
    name: String,
    transport: TransportPtr,
    session: Mutex<Option<InitializeResult>>,
}

impl McpClient {
    /// Wrap an already-connected transport. Call [`McpClient::initialize`] next.
    pub fn new(name: impl Into<String>, transport: TransportPtr) -> Self {
        Self {
            name: name.into(),
            transport,
            session: Mutex::new(None),
        }
    }

    /// Spawn a server subprocess, connect to it and run the handshake.
    ///
    /// The subprocess is killed again if the handshake fails.
    pub async fn connect_child(
        name: impl Into<String>,
        config: McpServerConfig,
    ) -> Result<Self, RpcError> {
        let name = name.into();
        let transport = Arc::new(ChildProcessTransport::new(name.clone(), config));
        transport.connect().await?;

        let client = Self::new(name, transport);
        let client_info = Implementation::new("conduit", env!("CARGO_PKG_VERSION"));
        if let Err(e) = client
            .initialize(client_info, ClientCapabilities::default())
            .await
        {
            let _ = client.shutdown().await;
            return Err(e);
        }
        Ok(client)
    }

    /// Perform the `initialize` handshake.
    ///
    /// Both the outgoing params and the server's result are validated, and the
    /// protocol version must match exactly. On success the
    /// `notifications/initialized` acknowledgement is sent.
    pub async fn initialize(
        &self,
        client_info: Implementation,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResult, RpcError> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities,
            client_info,
        };
        let params_value = serde_json::to_value(&params)?;
        negotiate::validate_initialize_params(&params_value)?;

        let result_value = self
            .transport
            .request("initialize", Some(params_value))
            .await?;
        negotiate::validate_initialize_result(&result_value)?;
        let mut result: InitializeResult = serde_json::from_value(result_value)?;

        let version =
            negotiate::negotiate_protocol_version(&params.protocol_version, &result.protocol_version)?;
        negotiate::parse_client_capabilities(params.capabilities)?;
        result.capabilities = negotiate::parse_server_capabilities(result.capabilities)?;

        self.transport
            .notify("notifications/initialized", None)
            .await?;

        tracing::info!(
            "MCP server '{}' initialized: {} {} (protocol {version})",
            self.name,
            result.server_info.name,
            result.server_info.version
        );
        *self.lock_session() = Some(result.clone());
        Ok(result)
    }

    /// Check the server is responsive.
    ///
    /// Accepts `{"status": "pong"}` as well as the empty object most servers
    /// reply with.
    pub async fn ping(&self) -> Result<(), RpcError> {
        let result = self.transport.request("ping", None).await?;
        if result.get("status").is_some() {
            let frame = serde_json::json!({"jsonrpc": "2.0", "id": 0, "result": result});
            negotiate::validate_ping_response(&frame)?;
        }
        Ok(())
    }

    /// Discover the tools this server exposes.
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>, RpcError> {
        let result = self.transport.request("tools/list", None).await?;
        let list: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| RpcError::Parse(format!("Failed to parse tools/list result: {e}")))?;
        Ok(list
            .tools
            .into_iter()
            .map(|t| McpToolInfo {
                name: t.name,
                description: t.description.unwrap_or_default(),
                input_schema: t.input_schema,
            })
            .collect())
    }

    /// Call a tool on this server.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<McpToolResult, RpcError> {
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let result = self.transport.request("tools/call", Some(params)).await?;
        let call_result: ToolCallResult = serde_json::from_value(result)
            .map_err(|e| RpcError::Parse(format!("Failed to parse tools/call result: {e}")))?;

        Ok(McpToolResult {
            content: call_result.content,
            is_error: call_result.is_error,
        })
    }

    /// The server's `initialize` result, once the handshake has completed.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.lock_session().clone()
    }

    /// Get the server name.
    pub fn server_name(&self) -> &str {
        &self.name
    }

    /// Shut down the server connection.
    pub async fn shutdown(&self) -> Result<(), RpcError> {
        self.transport.close().await
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<InitializeResult>> {
        lock_ignore_poison(&self.session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_tool_entry() {
        let json = r#"{
            "name": "summarize_text",
            "description": "Summarize a passage",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "text": {"type": "string"}
                },
                "required": ["text"]
            }
        }"#;
        let entry: ToolEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.name, "summarize_text");
        assert_eq!(entry.description.as_deref(), Some("Summarize a passage"));
    }

    #[test]
    fn deserialize_tool_entry_without_schema() {
        let entry: ToolEntry = serde_json::from_str(r#"{"name": "list"}"#).unwrap();
        assert!(entry.description.is_none());
        assert_eq!(entry.input_schema["type"], "object");
    }

    #[test]
    fn deserialize_tool_call_result_text() {
        let json = r#"{
            "content": [{"type": "text", "text": "three entities found"}],
            "isError": false
        }"#;
        let result: ToolCallResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.content.len(), 1);
        assert!(!result.is_error);
        match &result.content[0] {
            McpToolContent::Text { text } => assert_eq!(text, "three entities found"),
            _ => panic!("Expected text content"),
        }
    }

    #[test]
    fn deserialize_tool_call_result_error() {
        let json = r#"{
            "content": [{"type": "text", "text": "not found"}],
            "isError": true
        }"#;
        let result: ToolCallResult = serde_json::from_str(json).unwrap();
        assert!(result.is_error);
    }

    #[test]
    fn unknown_content_types_are_tolerated() {
        let json = r#"{
            "content": [
                {"type": "audio", "data": "..."},
                {"type": "resource", "resource": {"uri": "doc://1"}},
                {"type": "text", "text": "ok"}
            ]
        }"#;
        let result: ToolCallResult = serde_json::from_str(json).unwrap();
        assert!(matches!(result.content[0], McpToolContent::Unsupported));
        assert!(matches!(result.content[1], McpToolContent::Resource { .. }));
        let result = McpToolResult {
            content: result.content,
            is_error: result.is_error,
        };
        assert_eq!(result.text(), "ok");
    }

    #[test]
    fn deserialize_tools_list_result() {
        let json = r#"{
            "tools": [
                {"name": "a", "description": "Tool A", "inputSchema": {"type": "object"}},
                {"name": "b", "inputSchema": {"type": "object"}}
            ]
        }"#;
        let result: ToolsListResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.tools.len(), 2);
        assert_eq!(result.tools[0].name, "a");
        assert!(result.tools[1].description.is_none());
    }
}
