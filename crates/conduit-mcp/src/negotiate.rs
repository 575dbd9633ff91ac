//! Protocol version agreement and handshake validation.
//!
//! Validators only inspect their input; they never coerce or fill defaults.

use conduit_types::{ClientCapabilities, RpcError, ServerCapabilities};
use serde_json::Value;

use crate::schema;

/// Agree on a protocol version.
///
/// Succeeds only when both sides name exactly the same version; there is no
/// range or semver compatibility.
pub fn negotiate_protocol_version(client: &str, server: &str) -> Result<String, RpcError> {
    if client == server {
        Ok(client.to_string())
    } else {
        Err(RpcError::ProtocolVersionMismatch {
            client: client.to_string(),
            server: server.to_string(),
        })
    }
}

/// Validate an `initialize` request.
///
/// Accepts either the full JSON-RPC frame or just its `params` object.
pub fn validate_initialize_request(message: &Value) -> Result<(), RpcError> {
    if message.get("method").is_some() {
        schema::INITIALIZE_REQUEST.validate(message)
    } else {
        schema::INITIALIZE_PARAMS.validate(message)
    }
}

pub fn validate_initialize_params(params: &Value) -> Result<(), RpcError> {
    schema::INITIALIZE_PARAMS.validate(params)
}

/// Validate the `result` member of an `initialize` response.
pub fn validate_initialize_result(result: &Value) -> Result<(), RpcError> {
    schema::INITIALIZE_RESULT.validate(result)
}

/// Validate a complete `initialize` response frame.
pub fn validate_initialize_response(response: &Value) -> Result<(), RpcError> {
    schema::INITIALIZE_RESPONSE.validate(response)
}

pub fn validate_ping_request(request: &Value) -> Result<(), RpcError> {
    schema::PING_REQUEST.validate(request)
}

pub fn validate_ping_response(response: &Value) -> Result<(), RpcError> {
    schema::PING_RESPONSE.validate(response)
}

pub fn validate_client_capabilities(capabilities: &Value) -> Result<(), RpcError> {
    schema::CLIENT_CAPABILITIES.validate(capabilities)
}

pub fn validate_server_capabilities(capabilities: &Value) -> Result<(), RpcError> {
    schema::SERVER_CAPABILITIES.validate(capabilities)
}

/// Extension point for capability-specific checks. Currently the identity.
pub fn parse_client_capabilities(
    capabilities: ClientCapabilities,
) -> Result<ClientCapabilities, RpcError> {
    Ok(capabilities)
}

/// Extension point for capability-specific checks. Currently the identity.
pub fn parse_server_capabilities(
    capabilities: ServerCapabilities,
) -> Result<ServerCapabilities, RpcError> {
    Ok(capabilities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::{ErrorCode, LATEST_PROTOCOL_VERSION, ListChanged};
    use serde_json::json;

    fn initialize_params() -> Value {
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"roots": {"listChanged": true}},
            "clientInfo": {"name": "conduit", "version": "0.1.0"}
        })
    }

    #[test]
    fn identical_versions_agree() {
        assert_eq!(
            negotiate_protocol_version("2024-11-05", "2024-11-05").unwrap(),
            "2024-11-05"
        );
        assert_eq!(
            negotiate_protocol_version(LATEST_PROTOCOL_VERSION, LATEST_PROTOCOL_VERSION).unwrap(),
            LATEST_PROTOCOL_VERSION
        );
    }

    #[test]
    fn different_versions_carry_both_values() {
        match negotiate_protocol_version("2024-11-05", "2023-01-01") {
            Err(err @ RpcError::ProtocolVersionMismatch { .. }) => {
                assert_eq!(err.code(), ErrorCode::ProtocolVersionMismatch);
                let RpcError::ProtocolVersionMismatch { client, server } = err else {
                    unreachable!()
                };
                assert_eq!(client, "2024-11-05");
                assert_eq!(server, "2023-01-01");
            }
            other => panic!("Expected ProtocolVersionMismatch, got: {other:?}"),
        }
    }

    #[test]
    fn no_partial_version_matching() {
        assert!(negotiate_protocol_version("2024-11-05", "2024-11").is_err());
        assert!(negotiate_protocol_version("2024-11-05", " 2024-11-05").is_err());
    }

    #[test]
    fn initialize_request_accepts_complete_params() {
        assert!(validate_initialize_request(&initialize_params()).is_ok());
        let frame = json!({
            "jsonrpc": "2.0", "id": 0, "method": "initialize", "params": initialize_params()
        });
        assert!(validate_initialize_request(&frame).is_ok());
    }

    #[test]
    fn initialize_request_without_client_info_is_invalid_params() {
        let mut params = initialize_params();
        params.as_object_mut().unwrap().remove("clientInfo");

        let err = validate_initialize_request(&params).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParams);
        match err {
            RpcError::Validation { diagnostics, .. } => {
                assert!(!diagnostics.is_empty());
                assert!(diagnostics.iter().any(|d| d.contains("clientInfo")));
            }
            other => panic!("Expected Validation, got: {other:?}"),
        }
    }

    #[test]
    fn validation_does_not_mutate_input() {
        let params = json!({"protocolVersion": 5});
        let before = params.clone();
        assert!(validate_initialize_params(&params).is_err());
        assert_eq!(params, before);
    }

    #[test]
    fn initialize_result_and_response() {
        let result = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {"name": "nlp", "version": "1.0.0"}
        });
        assert!(validate_initialize_result(&result).is_ok());
        assert!(
            validate_initialize_response(&json!({"jsonrpc": "2.0", "id": 1, "result": result}))
                .is_ok()
        );

        let missing_server_info = json!({"protocolVersion": "2024-11-05", "capabilities": {}});
        assert!(validate_initialize_result(&missing_server_info).is_err());
    }

    #[test]
    fn ping_shapes() {
        assert!(validate_ping_request(&json!({"jsonrpc": "2.0", "id": 3, "method": "ping"})).is_ok());
        assert!(validate_ping_request(&json!({"jsonrpc": "2.0", "id": 3, "method": "pong"})).is_err());
        assert!(validate_ping_request(&json!({"jsonrpc": "2.0", "method": "ping"})).is_err());
        assert!(
            validate_ping_response(&json!({"jsonrpc": "2.0", "id": 3, "result": {"status": "pong"}}))
                .is_ok()
        );
        assert!(validate_ping_response(&json!({"jsonrpc": "2.0", "id": 3, "result": {}})).is_err());
    }

    #[test]
    fn capability_validation() {
        assert!(validate_client_capabilities(&json!({"sampling": {}})).is_ok());
        assert!(validate_server_capabilities(&json!({"tools": []})).is_err());
    }

    #[test]
    fn capability_parsing_is_identity() {
        let client = ClientCapabilities {
            roots: Some(ListChanged {
                list_changed: Some(true),
            }),
            ..Default::default()
        };
        assert_eq!(parse_client_capabilities(client.clone()).unwrap(), client);

        let server = ServerCapabilities::default();
        assert_eq!(parse_server_capabilities(server.clone()).unwrap(), server);
    }
}
