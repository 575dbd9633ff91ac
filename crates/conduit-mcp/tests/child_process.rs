//! Child-process transport tests against real subprocesses.
//!
//! `sed -u` rewrites each request line into a response line, which makes it a
//! tiny unbuffered JSON-RPC server for the shapes used here.

#![cfg(target_os = "linux")]

use std::sync::Arc;
use std::time::Duration;

use conduit_mcp::{ChildProcessTransport, ConnectionState, McpClient, McpServerConfig};
use conduit_types::RpcError;
use serde_json::json;

/// Answers `ping` with `{}`, echoes `tools/call` params back as the result and
/// answers `initialize` with a fixed 2024-11-05 result.
fn sed_server() -> McpServerConfig {
    McpServerConfig::new("sed").with_args([
        "-u",
        "-e",
        r#"s/"method":"ping"/"result":{}/"#,
        "-e",
        r#"s/"method":"tools\/call","params":/"result":/"#,
        "-e",
        r#"s/"method":"initialize".*/"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"sed","version":"4"}}}/"#,
    ])
}

async fn wait_for_pending(transport: &ChildProcessTransport, expected: usize) {
    for _ in 0..200 {
        if transport.pending_requests() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected {expected} pending requests, have {}",
        transport.pending_requests()
    );
}

#[tokio::test]
async fn tool_call_round_trip_through_subprocess() {
    let transport = ChildProcessTransport::new("sed", sed_server());
    transport.connect().await.unwrap();
    assert_eq!(transport.state(), ConnectionState::Connected);

    let result = transport
        .call_tool("summarize_text", json!({"text": "hello"}))
        .await
        .unwrap();
    assert_eq!(result["name"], "summarize_text");
    assert_eq!(result["arguments"]["text"], "hello");

    assert_eq!(transport.request("ping", None).await.unwrap(), json!({}));
    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn concurrent_calls_are_correlated() {
    let transport = Arc::new(ChildProcessTransport::new("sed", sed_server()));
    transport.connect().await.unwrap();

    let calls: Vec<_> = (0..8)
        .map(|i| {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .call_tool(&format!("tool_{i}"), json!({"n": i}))
                    .await
            })
        })
        .collect();

    for (i, call) in calls.into_iter().enumerate() {
        let result = call.await.unwrap().unwrap();
        assert_eq!(result["name"], format!("tool_{i}"));
        assert_eq!(result["arguments"]["n"], i);
    }
    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn disconnect_rejects_outstanding_calls() {
    // `sleep` never answers, so both calls stay pending.
    let transport = Arc::new(ChildProcessTransport::new(
        "silent",
        McpServerConfig::new("sleep").with_args(["30"]),
    ));
    transport.connect().await.unwrap();

    let calls: Vec<_> = ["first", "second"]
        .into_iter()
        .map(|name| {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.call_tool(name, json!({})).await })
        })
        .collect();
    wait_for_pending(&transport, 2).await;

    transport.disconnect().await.unwrap();
    for call in calls {
        assert!(matches!(call.await.unwrap(), Err(RpcError::TransportClosed)));
    }
    assert_eq!(transport.state(), ConnectionState::Closed);
    assert!(matches!(
        transport.call_tool("third", json!({})).await,
        Err(RpcError::NotConnected)
    ));
}

#[tokio::test]
async fn subprocess_exit_fails_pending_call() {
    // Reads one request, then exits without answering.
    let transport = ChildProcessTransport::new(
        "quitter",
        McpServerConfig::new("sh").with_args(["-c", "read line; exit 0"]),
    );
    transport.connect().await.unwrap();

    assert!(matches!(
        transport.call_tool("anything", json!({})).await,
        Err(RpcError::TransportClosed)
    ));
}

#[tokio::test]
async fn client_connects_and_initializes_child() {
    let client = McpClient::connect_child("sed", sed_server()).await.unwrap();

    let info = client.server_info().unwrap();
    assert_eq!(info.protocol_version, "2024-11-05");
    assert_eq!(info.server_info.name, "sed");
    assert!(info.capabilities.supports_tools());

    client.ping().await.unwrap();
    client.shutdown().await.unwrap();
    assert!(matches!(client.ping().await, Err(RpcError::NotConnected)));
}
