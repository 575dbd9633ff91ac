//! In-process broker.
//!
//! This is the reference implementation of broker semantics used by the
//! tests: named work queues hold messages until their single consumer takes
//! them, and every reply channel gets a unique address that only it receives
//! from.
//!
//! ## Non-Goals
//!
//! - Persistence across process restarts
//! - Network behavior or failure simulation

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use conduit_types::RpcError;
use tokio::sync::{RwLock, mpsc};

use crate::broker::{Broker, DIRECT_REPLY_TO, InboundMessage, OutboundMessage, ReplyChannel};

struct Queue {
    tx: mpsc::UnboundedSender<InboundMessage>,
    rx: Option<mpsc::UnboundedReceiver<InboundMessage>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
struct Inner {
    queues: RwLock<HashMap<String, Queue>>,
    replies: RwLock<HashMap<String, mpsc::UnboundedSender<InboundMessage>>>,
    next_reply: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::TransportClosed);
        }
        let inbound = InboundMessage {
            payload: message.payload,
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
        };

        if queue.starts_with(DIRECT_REPLY_TO) {
            let replies = self.replies.read().await;
            let delivered = match replies.get(queue) {
                Some(tx) => tx.send(inbound).is_ok(),
                None => false,
            };
            if !delivered {
                tracing::debug!("Reply address {queue} is gone, dropping message");
            }
            return Ok(());
        }

        let mut queues = self.queues.write().await;
        let slot = queues.entry(queue.to_string()).or_insert_with(Queue::new);
        if slot.tx.send(inbound).is_err() {
            tracing::debug!("Consumer of {queue} is gone, dropping message");
        }
        Ok(())
    }
}

/// In-memory broker; cheap to clone, all clones share the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the consuming end of `queue`, creating the queue if needed.
    ///
    /// Messages published before this call are delivered too. Each queue has
    /// at most one consumer.
    pub async fn consume(
        &self,
        queue: &str,
    ) -> Result<mpsc::UnboundedReceiver<InboundMessage>, RpcError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::TransportClosed);
        }
        let mut queues = self.inner.queues.write().await;
        queues
            .entry(queue.to_string())
            .or_insert_with(Queue::new)
            .rx
            .take()
            .ok_or_else(|| RpcError::Broker(format!("queue '{queue}' already has a consumer")))
    }

    /// Number of reply channels currently open.
    pub async fn open_reply_channels(&self) -> usize {
        self.inner.replies.read().await.len()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), RpcError> {
        self.inner.publish(queue, message).await
    }

    async fn open_reply_channel(&self) -> Result<Box<dyn ReplyChannel>, RpcError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::TransportClosed);
        }
        let n = self.inner.next_reply.fetch_add(1, Ordering::Relaxed);
        let address = format!("{DIRECT_REPLY_TO}.memory-{n}");
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.replies.write().await.insert(address.clone(), tx);
        Ok(Box::new(MemoryReplyChannel {
            address,
            inner: Arc::clone(&self.inner),
            rx,
        }))
    }

    /// Drop every queue and reply channel; open reply channels see `None`.
    async fn close(&self) -> Result<(), RpcError> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.replies.write().await.clear();
        self.inner.queues.write().await.clear();
        Ok(())
    }
}

struct MemoryReplyChannel {
    address: String,
    inner: Arc<Inner>,
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

#[async_trait::async_trait]
impl ReplyChannel for MemoryReplyChannel {
    fn reply_to(&self) -> &str {
        &self.address
    }

    async fn publish(&mut self, queue: &str, message: OutboundMessage) -> Result<(), RpcError> {
        self.inner.publish(queue, message).await
    }

    async fn next_reply(&mut self) -> Result<Option<InboundMessage>, RpcError> {
        Ok(self.rx.recv().await)
    }

    async fn close(self: Box<Self>) -> Result<(), RpcError> {
        self.inner.replies.write().await.remove(&self.address);
        Ok(())
    }
}
