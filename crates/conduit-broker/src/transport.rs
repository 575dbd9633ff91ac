//! JSON-RPC over a broker work queue.
//!
//! Lets protocol code such as `McpClient` talk to a queue-fed worker exactly
//! as it would to a child process.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use conduit_mcp::jsonrpc::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, RequestId};
use conduit_types::{RpcError, RpcTransport};
use serde_json::Value;

use crate::broker::OutboundMessage;
use crate::rpc::BrokerRpc;

/// An [`RpcTransport`] whose requests are JSON-RPC frames published to one
/// queue, each answered on its own reply channel.
pub struct QueueTransport {
    rpc: Arc<BrokerRpc>,
    queue: String,
    next_id: AtomicI64,
}

impl QueueTransport {
    pub fn new(rpc: Arc<BrokerRpc>, queue: impl Into<String>) -> Self {
        Self {
            rpc,
            queue: queue.into(),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

fn mismatched_id(sent: &RequestId, received: Option<&RequestId>) -> RpcError {
    let received = received.map_or_else(|| "null".to_string(), ToString::to_string);
    RpcError::InvalidRequest(format!(
        "reply carries id {received} but request {sent} was sent"
    ))
}

#[async_trait::async_trait]
impl RpcTransport for QueueTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let frame = serde_json::to_vec(&JsonRpcRequest::new(id.clone(), method, params))?;
        let reply = self.rpc.send_bytes(&self.queue, Bytes::from(frame)).await?;

        match JsonRpcMessage::from_slice(&reply)? {
            JsonRpcMessage::Response(response) if response.id == id => Ok(response.result),
            JsonRpcMessage::Error(error) if error.id.as_ref() == Some(&id) => {
                Err(error.error.into())
            }
            JsonRpcMessage::Response(response) => Err(mismatched_id(&id, Some(&response.id))),
            JsonRpcMessage::Error(error) => Err(mismatched_id(&id, error.id.as_ref())),
            other => Err(RpcError::InvalidRequest(format!(
                "expected a response to {method}, got {other:?}"
            ))),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        let frame = serde_json::to_vec(&JsonRpcNotification::new(method, params))?;
        self.rpc
            .broker()
            .publish(&self.queue, OutboundMessage::persistent(frame))
            .await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.rpc.close().await
    }
}
