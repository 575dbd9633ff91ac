//! JSON Schemas for the MCP handshake messages.
//!
//! Each schema is self-contained (no `$ref`) and compiled once per process.
//! Capability schemas only constrain the shape of flags that are present;
//! unknown members are allowed so newer peers can advertise more.

use std::sync::LazyLock;

use conduit_types::{JSONRPC_VERSION, RpcError};
use jsonschema::{Validator, validator_for};
use serde_json::{Value, json};

fn request_id() -> Value {
    json!({ "type": ["string", "integer"] })
}

fn implementation() -> Value {
    json!({
        "type": "object",
        "required": ["name", "version"],
        "properties": {
            "name": { "type": "string" },
            "version": { "type": "string" }
        }
    })
}

fn list_changed() -> Value {
    json!({
        "type": "object",
        "properties": { "listChanged": { "type": "boolean" } }
    })
}

pub fn client_capabilities_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "experimental": { "type": "object" },
            "roots": list_changed(),
            "sampling": { "type": "object" }
        }
    })
}

pub fn server_capabilities_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "experimental": { "type": "object" },
            "logging": { "type": "object" },
            "prompts": list_changed(),
            "resources": {
                "type": "object",
                "properties": {
                    "subscribe": { "type": "boolean" },
                    "listChanged": { "type": "boolean" }
                }
            },
            "tools": list_changed(),
            "supportedProtocolVersions": {
                "type": "array",
                "items": { "type": "string" }
            },
            "maxBatchSize": { "type": "integer", "minimum": 1 }
        }
    })
}

pub fn initialize_params_schema() -> Value {
    json!({
        "type": "object",
        "required": ["protocolVersion", "capabilities", "clientInfo"],
        "properties": {
            "protocolVersion": { "type": "string" },
            "capabilities": client_capabilities_schema(),
            "clientInfo": implementation()
        }
    })
}

pub fn initialize_request_schema() -> Value {
    json!({
        "type": "object",
        "required": ["jsonrpc", "id", "method", "params"],
        "properties": {
            "jsonrpc": { "const": JSONRPC_VERSION },
            "id": request_id(),
            "method": { "const": "initialize" },
            "params": initialize_params_schema()
        }
    })
}

pub fn initialize_result_schema() -> Value {
    json!({
        "type": "object",
        "required": ["protocolVersion", "capabilities", "serverInfo"],
        "properties": {
            "protocolVersion": { "type": "string" },
            "capabilities": server_capabilities_schema(),
            "serverInfo": implementation(),
            "instructions": { "type": "string" }
        }
    })
}

pub fn initialize_response_schema() -> Value {
    json!({
        "type": "object",
        "required": ["jsonrpc", "id", "result"],
        "properties": {
            "jsonrpc": { "const": JSONRPC_VERSION },
            "id": request_id(),
            "result": initialize_result_schema()
        }
    })
}

pub fn ping_request_schema() -> Value {
    json!({
        "type": "object",
        "required": ["jsonrpc", "id", "method"],
        "properties": {
            "jsonrpc": { "const": JSONRPC_VERSION },
            "id": request_id(),
            "method": { "const": "ping" }
        }
    })
}

pub fn ping_response_schema() -> Value {
    json!({
        "type": "object",
        "required": ["jsonrpc", "id", "result"],
        "properties": {
            "jsonrpc": { "const": JSONRPC_VERSION },
            "id": request_id(),
            "result": {
                "type": "object",
                "required": ["status"],
                "properties": { "status": { "const": "pong" } }
            }
        }
    })
}

/// A named, precompiled schema.
pub struct Schema {
    name: &'static str,
    compiled: Result<Validator, String>,
}

impl Schema {
    fn compile(name: &'static str, schema: Value) -> Self {
        let compiled = validator_for(&schema).map_err(|e| e.to_string());
        if let Err(e) = &compiled {
            tracing::error!("Schema '{name}' failed to compile: {e}");
        }
        Self { name, compiled }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Check `instance` without modifying it.
    ///
    /// Fails with [`RpcError::Validation`] listing every violation found.
    pub fn validate(&self, instance: &Value) -> Result<(), RpcError> {
        let validator = self.compiled.as_ref().map_err(|e| RpcError::Validation {
            schema: self.name.to_string(),
            diagnostics: vec![format!("schema failed to compile: {e}")],
        })?;
        if validator.is_valid(instance) {
            return Ok(());
        }
        let diagnostics = validator
            .iter_errors(instance)
            .map(|e| e.to_string())
            .collect();
        Err(RpcError::Validation {
            schema: self.name.to_string(),
            diagnostics,
        })
    }
}

pub static CLIENT_CAPABILITIES: LazyLock<Schema> =
    LazyLock::new(|| Schema::compile("ClientCapabilities", client_capabilities_schema()));
pub static SERVER_CAPABILITIES: LazyLock<Schema> =
    LazyLock::new(|| Schema::compile("ServerCapabilities", server_capabilities_schema()));
pub static INITIALIZE_PARAMS: LazyLock<Schema> =
    LazyLock::new(|| Schema::compile("InitializeParams", initialize_params_schema()));
pub static INITIALIZE_REQUEST: LazyLock<Schema> =
    LazyLock::new(|| Schema::compile("InitializeRequest", initialize_request_schema()));
pub static INITIALIZE_RESULT: LazyLock<Schema> =
    LazyLock::new(|| Schema::compile("InitializeResult", initialize_result_schema()));
pub static INITIALIZE_RESPONSE: LazyLock<Schema> =
    LazyLock::new(|| Schema::compile("InitializeResponse", initialize_response_schema()));
pub static PING_REQUEST: LazyLock<Schema> =
    LazyLock::new(|| Schema::compile("PingRequest", ping_request_schema()));
pub static PING_RESPONSE: LazyLock<Schema> =
    LazyLock::new(|| Schema::compile("PingResponse", ping_response_schema()));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_schemas_compile() {
        for schema in [
            &*CLIENT_CAPABILITIES,
            &*SERVER_CAPABILITIES,
            &*INITIALIZE_PARAMS,
            &*INITIALIZE_REQUEST,
            &*INITIALIZE_RESULT,
            &*INITIALIZE_RESPONSE,
            &*PING_REQUEST,
            &*PING_RESPONSE,
        ] {
            assert!(schema.compiled.is_ok(), "{} did not compile", schema.name());
        }
    }

    #[test]
    fn capabilities_allow_unknown_flags() {
        let caps = json!({"tools": {"listChanged": true}, "futureFeature": {"x": 1}});
        assert!(SERVER_CAPABILITIES.validate(&caps).is_ok());
        assert!(CLIENT_CAPABILITIES.validate(&json!({})).is_ok());
    }

    #[test]
    fn capabilities_reject_wrong_flag_types() {
        let caps = json!({"roots": {"listChanged": "yes"}});
        match CLIENT_CAPABILITIES.validate(&caps) {
            Err(RpcError::Validation {
                schema,
                diagnostics,
            }) => {
                assert_eq!(schema, "ClientCapabilities");
                assert_eq!(diagnostics.len(), 1);
            }
            other => panic!("Expected Validation, got: {other:?}"),
        }
    }

    #[test]
    fn every_violation_is_reported() {
        let params = json!({"capabilities": []});
        let Err(RpcError::Validation { diagnostics, .. }) = INITIALIZE_PARAMS.validate(&params)
        else {
            panic!("Expected validation failure");
        };
        // Missing members and the mistyped capabilities are all listed.
        assert!(diagnostics.len() >= 2, "{diagnostics:?}");
        assert!(diagnostics.iter().any(|d| d.contains("protocolVersion")));
    }

    #[test]
    fn ping_response_requires_pong() {
        let ok = json!({"jsonrpc": "2.0", "id": 1, "result": {"status": "pong"}});
        let wrong = json!({"jsonrpc": "2.0", "id": 1, "result": {"status": "ok"}});
        assert!(PING_RESPONSE.validate(&ok).is_ok());
        assert!(PING_RESPONSE.validate(&wrong).is_err());
    }
}
