//! JSON-RPC 2.0 types for MCP communication.

use std::fmt;

use conduit_types::{JSONRPC_VERSION, RpcError, RpcErrorObject};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier binding a request to its response.
///
/// Number `1` and string `"1"` are distinct ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A successful JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Value,
}

impl JsonRpcResponse {
    pub fn new(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result,
        }
    }
}

/// A JSON-RPC 2.0 error response.
///
/// `id` is `None` only when the peer could not determine which request failed
/// (for example its own parse errors); such frames cannot be correlated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    pub error: RpcErrorObject,
}

impl JsonRpcErrorResponse {
    pub fn new(id: Option<RequestId>, error: RpcErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error,
        }
    }
}

/// Any JSON-RPC 2.0 message, distinguished by which members are present.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcErrorResponse),
}

impl JsonRpcMessage {
    /// Classify a parsed JSON value.
    ///
    /// `method` with `id` is a request, `method` alone a notification, `result`
    /// a response and `error` an error response. Anything else is rejected as
    /// [`RpcError::InvalidRequest`].
    pub fn classify(value: Value) -> Result<Self, RpcError> {
        let Some(obj) = value.as_object() else {
            return Err(RpcError::InvalidRequest("message is not an object".into()));
        };
        let has_id = obj.get("id").is_some_and(|id| !id.is_null());

        let message = if obj.contains_key("method") {
            if has_id {
                JsonRpcMessage::Request(serde_json::from_value(value)?)
            } else {
                JsonRpcMessage::Notification(serde_json::from_value(value)?)
            }
        } else if obj.contains_key("result") {
            if !has_id {
                return Err(RpcError::InvalidRequest("response without id".into()));
            }
            JsonRpcMessage::Response(serde_json::from_value(value)?)
        } else if obj.contains_key("error") {
            JsonRpcMessage::Error(serde_json::from_value(value)?)
        } else {
            return Err(RpcError::InvalidRequest(
                "message has neither method, result nor error".into(),
            ));
        };
        Ok(message)
    }

    /// Parse and classify one frame.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, RpcError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| RpcError::Parse(e.to_string()))?;
        Self::classify(value)
    }

    /// The id this message carries, if any.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.id),
            JsonRpcMessage::Response(r) => Some(&r.id),
            JsonRpcMessage::Error(e) => e.id.as_ref(),
            JsonRpcMessage::Notification(_) => None,
        }
    }

    /// The method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            _ => None,
        }
    }
}
