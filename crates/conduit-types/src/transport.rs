//! The request/response seam shared by every transport variant.

use std::sync::Arc;

use serde_json::Value;

use crate::error::RpcError;

/// A connection that can carry JSON-RPC requests to a peer.
///
/// The child-process transport and the queue-backed broker transport both
/// implement this, so protocol code such as the MCP client never names a
/// concrete transport type.
#[async_trait::async_trait]
pub trait RpcTransport: Send + Sync {
    /// Send a request and suspend until its correlated response arrives.
    ///
    /// Resolves with the response `result`, or fails with
    /// [`RpcError::RemoteTool`] when the peer answers with an error frame.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError>;

    /// Send a notification; no response is expected.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError>;

    /// Close the transport, failing anything still outstanding.
    async fn close(&self) -> Result<(), RpcError>;
}

/// Shared, type-erased transport handle.
pub type TransportPtr = Arc<dyn RpcTransport>;
