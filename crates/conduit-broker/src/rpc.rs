//! Request/reply over a work queue.
//!
//! Each call publishes its request with a fresh correlation id and a private
//! reply address, then waits for the one reply carrying that id. Replies with
//! any other id are ignored. No ordering holds between independent calls.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use conduit_types::{CorrelationRegistry, ErrorCode, RpcError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::broker::{BrokerPtr, OutboundMessage, ReplyChannel};
use crate::config::BrokerConfig;
use crate::correlation::CorrelationId;

type ReplyRegistry = CorrelationRegistry<CorrelationId, Bytes>;

/// The reply envelope workers send back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// The `data` of a successful reply, or the worker's error as
    /// [`RpcError::RemoteTool`].
    pub fn into_result(self) -> Result<Value, RpcError> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(RpcError::RemoteTool {
                code: ErrorCode::InternalError.code(),
                message: self
                    .error
                    .unwrap_or_else(|| "worker reported failure".to_string()),
                data: self.data,
            })
        }
    }
}

/// Body of a message on the long-running task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub task_type: String,
    pub payload: Value,
}

/// Broker-backed RPC client.
///
/// Cheap to share: the registry of in-flight calls is common to every call
/// made through one `BrokerRpc`, while each call gets its own reply channel.
pub struct BrokerRpc {
    broker: BrokerPtr,
    registry: Arc<ReplyRegistry>,
    reply_timeout: Duration,
    task_queue: String,
}

impl BrokerRpc {
    pub fn new(broker: BrokerPtr, config: &BrokerConfig) -> Self {
        Self {
            broker,
            registry: Arc::new(ReplyRegistry::new()),
            reply_timeout: config.reply_timeout(),
            task_queue: config.task_queue.clone(),
        }
    }

    /// Send `request` to `queue` as JSON and decode the JSON reply.
    ///
    /// Fails with [`RpcError::Timeout`] if no reply arrives within the reply
    /// timeout. Lost replies are not retried.
    pub async fn send_to_queue<Req, Resp>(&self, queue: &str, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)?;
        let reply = self.send_bytes(queue, Bytes::from(body)).await?;
        serde_json::from_slice(&reply)
            .map_err(|e| RpcError::Parse(format!("Failed to parse reply from '{queue}': {e}")))
    }

    /// Send `request` and unwrap the worker's [`RpcResponse`] envelope.
    pub async fn call<Req>(&self, queue: &str, request: &Req) -> Result<Value, RpcError>
    where
        Req: Serialize + ?Sized,
    {
        self.send_to_queue::<Req, RpcResponse>(queue, request)
            .await?
            .into_result()
    }

    /// Send a raw payload and return the raw reply payload.
    pub async fn send_bytes(&self, queue: &str, body: Bytes) -> Result<Bytes, RpcError> {
        let id = CorrelationId::generate();
        let span = tracing::debug_span!("broker_rpc", queue, correlation_id = %id);
        self.round_trip(queue, id, body).instrument(span).await
    }

    async fn round_trip(&self, queue: &str, id: CorrelationId, body: Bytes) -> Result<Bytes, RpcError> {
        let handle = self.registry.register(id.clone())?;
        let guard = self.registry.guard(id.clone());

        let mut channel = self.broker.open_reply_channel().await?;
        let message = OutboundMessage::request(body, id.clone(), channel.reply_to());
        if let Err(e) = channel.publish(queue, message).await {
            let _ = channel.close().await;
            return Err(e);
        }
        tracing::debug!("Sent request to {queue}");

        let (stop_tx, stop_rx) = oneshot::channel();
        let listener = tokio::spawn(
            listen_for_reply(channel, id.clone(), Arc::clone(&self.registry), stop_rx)
                .in_current_span(),
        );

        let result = self
            .registry
            .wait(&id, handle, Some(self.reply_timeout))
            .await;
        guard.disarm();
        let _ = stop_tx.send(());
        if listener.await.is_err() {
            tracing::debug!("Reply listener ended abnormally");
        }
        if let Err(RpcError::Timeout { timeout_ms }) = &result {
            tracing::warn!("No reply from {queue} within {timeout_ms}ms");
        }
        result
    }

    /// Publish a persistent `{taskType, payload}` message to the task queue
    /// without waiting for any reply.
    pub async fn enqueue_long_running_task(
        &self,
        task_type: &str,
        payload: Value,
    ) -> Result<(), RpcError> {
        let task = TaskMessage {
            task_type: task_type.to_string(),
            payload,
        };
        let body = serde_json::to_vec(&task)?;
        self.broker
            .publish(&self.task_queue, OutboundMessage::persistent(body))
            .await?;
        tracing::info!("Enqueued task of type '{task_type}' to queue '{}'", self.task_queue);
        Ok(())
    }

    pub fn broker(&self) -> &BrokerPtr {
        &self.broker
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.registry.len()
    }

    /// Fail every in-flight call with [`RpcError::TransportClosed`] and close
    /// the broker.
    pub async fn close(&self) -> Result<(), RpcError> {
        let failed = self.registry.close(|| RpcError::TransportClosed);
        if failed > 0 {
            tracing::warn!("{failed} in-flight call(s) failed: broker closed");
        }
        self.broker.close().await
    }
}

/// Wait on `channel` for the reply carrying `id`, then release the channel.
async fn listen_for_reply(
    mut channel: Box<dyn ReplyChannel>,
    id: CorrelationId,
    registry: Arc<ReplyRegistry>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            next = channel.next_reply() => match next {
                Ok(Some(reply)) if reply.correlation_id.as_ref() == Some(&id) => {
                    registry.resolve(&id, reply.payload);
                    break;
                }
                Ok(Some(reply)) => {
                    tracing::debug!(
                        "Ignoring reply with foreign correlation id {:?}",
                        reply.correlation_id.as_ref().map(CorrelationId::as_str)
                    );
                }
                Ok(None) => {
                    registry.reject(&id, RpcError::TransportClosed);
                    break;
                }
                Err(e) => {
                    registry.reject(&id, e);
                    break;
                }
            },
        }
    }
    if let Err(e) = channel.close().await {
        tracing::debug!("Closing reply channel failed: {e}");
    }
}
