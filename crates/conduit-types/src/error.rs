//! Error hierarchy for Conduit.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON-RPC compatible error codes used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ProtocolVersionMismatch,
    CapabilityNegotiationFailed,
}

impl ErrorCode {
    /// The integer carried in the `code` field of a JSON-RPC error object.
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ProtocolVersionMismatch => -32000,
            ErrorCode::CapabilityNegotiationFailed => -32001,
        }
    }

    /// Map a wire integer back to a known code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            -32000 => Some(ErrorCode::ProtocolVersionMismatch),
            -32001 => Some(ErrorCode::CapabilityNegotiationFailed),
            _ => None,
        }
    }
}

impl From<ErrorCode> for i64 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Errors raised while correlating, transporting or negotiating requests.
///
/// Every variant is scoped to the caller whose request failed; none of them
/// tears down a transport on its own.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Validation error against '{schema}' schema")]
    Validation {
        schema: String,
        diagnostics: Vec<String>,
    },

    #[error("Protocol version mismatch. Client: {client}, Server: {server}")]
    ProtocolVersionMismatch { client: String, server: String },

    #[error("Capability negotiation failed: {0}")]
    CapabilityNegotiationFailed(String),

    #[error("Remote error (code {code}): {message}")]
    RemoteTool {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Transport closed with request outstanding")]
    TransportClosed,

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Request id {0} is already pending")]
    DuplicateRequestId(String),

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        source: std::io::Error,
    },

    #[error("Process '{name}' exited during startup ({status})")]
    ProcessExited { name: String, status: String },

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// The JSON-RPC code this error is reported under.
    pub fn code(&self) -> ErrorCode {
        match self {
            RpcError::Validation { .. } => ErrorCode::InvalidParams,
            RpcError::ProtocolVersionMismatch { .. } => ErrorCode::ProtocolVersionMismatch,
            RpcError::CapabilityNegotiationFailed(_) => ErrorCode::CapabilityNegotiationFailed,
            RpcError::RemoteTool { code, .. } => {
                ErrorCode::from_code(*code).unwrap_or(ErrorCode::InternalError)
            }
            RpcError::Parse(_) | RpcError::Json(_) => ErrorCode::ParseError,
            RpcError::InvalidRequest(_) | RpcError::DuplicateRequestId(_) => {
                ErrorCode::InvalidRequest
            }
            RpcError::TransportClosed
            | RpcError::Timeout { .. }
            | RpcError::NotConnected
            | RpcError::SpawnFailed { .. }
            | RpcError::ProcessExited { .. }
            | RpcError::Broker(_)
            | RpcError::Io(_) => ErrorCode::InternalError,
        }
    }

    /// Render as a JSON-RPC error object suitable for sending back to a peer.
    ///
    /// Remote errors keep their original code and data.
    pub fn to_error_object(&self) -> RpcErrorObject {
        let data = match self {
            RpcError::Validation { diagnostics, .. } => Some(serde_json::json!(diagnostics)),
            RpcError::ProtocolVersionMismatch { client, server } => {
                Some(serde_json::json!({ "client": client, "server": server }))
            }
            RpcError::RemoteTool { data, .. } => data.clone(),
            _ => None,
        };
        let (code, message) = match self {
            RpcError::RemoteTool { code, message, .. } => (*code, message.clone()),
            RpcError::Validation { .. } => (self.code().code(), "Validation error".to_string()),
            other => (other.code().code(), other.to_string()),
        };
        RpcErrorObject {
            code,
            message,
            data,
        }
    }
}

impl From<RpcErrorObject> for RpcError {
    fn from(obj: RpcErrorObject) -> Self {
        RpcError::RemoteTool {
            code: obj.code,
            message: obj.message,
            data: obj.data,
        }
    }
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Missing required configuration: {key}")]
    MissingKey { key: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}
