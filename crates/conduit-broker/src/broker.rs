//! The broker seam: queues, messages and per-call reply channels.
//!
//! The broker only delivers opaque payloads plus the `correlation_id` and
//! `reply_to` properties. Correlation, timeouts and JSON handling live in
//! [`crate::rpc`].

use std::sync::Arc;

use bytes::Bytes;
use conduit_types::RpcError;

use crate::correlation::CorrelationId;

/// RabbitMQ's direct reply-to pseudo-queue. Reply addresses start with it.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

/// A message to publish.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub correlation_id: Option<CorrelationId>,
    /// Address the consumer should publish its reply to.
    pub reply_to: Option<String>,
    /// Ask the broker to persist the message.
    pub persistent: bool,
}

impl OutboundMessage {
    /// A persistent message with no reply expected.
    pub fn persistent(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            correlation_id: None,
            reply_to: None,
            persistent: true,
        }
    }

    /// A persistent request whose reply goes to `reply_to`.
    pub fn request(
        payload: impl Into<Bytes>,
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            payload: payload.into(),
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to.into()),
            persistent: true,
        }
    }

    /// A reply to `request`, carrying its correlation id.
    pub fn reply(request: &InboundMessage, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            correlation_id: request.correlation_id.clone(),
            reply_to: None,
            persistent: false,
        }
    }
}

/// A message received from a queue or reply channel.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub payload: Bytes,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
}

/// A private address that receives replies for one call.
///
/// Requests must be published through the channel that will receive their
/// replies, which is why publishing lives here as well as on [`Broker`].
#[async_trait::async_trait]
pub trait ReplyChannel: Send {
    /// The address to put in a request's `reply_to` property.
    fn reply_to(&self) -> &str;

    /// Publish to `queue`, declaring it durable first.
    async fn publish(&mut self, queue: &str, message: OutboundMessage) -> Result<(), RpcError>;

    /// Wait for the next reply. `None` once the channel has been torn down.
    async fn next_reply(&mut self) -> Result<Option<InboundMessage>, RpcError>;

    /// Stop consuming and release the channel.
    async fn close(self: Box<Self>) -> Result<(), RpcError>;
}

/// A message broker that can publish to named work queues and open reply
/// channels.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Publish to `queue`, declaring it durable first.
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), RpcError>;

    /// Open a fresh reply channel for a single call.
    async fn open_reply_channel(&self) -> Result<Box<dyn ReplyChannel>, RpcError>;

    /// Close the broker connection.
    async fn close(&self) -> Result<(), RpcError>;
}

/// Shared, type-erased broker handle.
pub type BrokerPtr = Arc<dyn Broker>;
