//! AMQP broker implementation using `lapin`.
//!
//! ## Queue semantics
//!
//! Work queues are declared durable and requests are published with
//! persistent delivery, so queued work survives a broker restart.
//!
//! Every channel is put in publisher-confirm mode: a publish succeeds only
//! once the broker has acked it, and a nack is an error.
//!
//! ## Replies
//!
//! Replies use RabbitMQ direct reply-to: the caller consumes the
//! `amq.rabbitmq.reply-to` pseudo-queue in no-ack mode and publishes its
//! request on the same channel. RabbitMQ allows one such consumer per
//! channel, so every reply channel opens its own AMQP channel and closes it
//! after the call.

use std::collections::HashSet;
use std::sync::Mutex;

use bytes::Bytes;
use conduit_types::{RpcError, lock_ignore_poison};
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    publisher_confirm::Confirmation,
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
};

use crate::broker::{Broker, DIRECT_REPLY_TO, InboundMessage, OutboundMessage, ReplyChannel};
use crate::correlation::CorrelationId;

fn amqp_error(action: &'static str) -> impl Fn(lapin::Error) -> RpcError {
    move |e| RpcError::Broker(format!("amqp: {action} failed: {e}"))
}

/// A broker connection over AMQP 0-9-1.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    declared: Mutex<HashSet<String>>,
}

impl AmqpBroker {
    /// Connect to the broker at `uri` (e.g. `amqp://localhost:5672/%2f`).
    pub async fn connect(uri: &str) -> Result<Self, RpcError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(amqp_error("connect"))?;
        let channel = open_confirmed_channel(&connection).await?;
        tracing::info!("Connected to AMQP broker");
        Ok(Self {
            connection,
            channel,
            declared: Mutex::new(HashSet::new()),
        })
    }

    async fn declare(&self, queue: &str) -> Result<(), RpcError> {
        // Reply addresses are broker-generated and cannot be declared.
        if queue.starts_with("amq.") || lock_ignore_poison(&self.declared).contains(queue) {
            return Ok(());
        }
        declare_durable(&self.channel, queue).await?;
        lock_ignore_poison(&self.declared).insert(queue.to_string());
        Ok(())
    }
}

async fn open_confirmed_channel(connection: &Connection) -> Result<Channel, RpcError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(amqp_error("create channel"))?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(amqp_error("confirm select"))?;
    Ok(channel)
}

async fn declare_durable(channel: &Channel, queue: &str) -> Result<(), RpcError> {
    let options = QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    };
    channel
        .queue_declare(queue.into(), options, FieldTable::default())
        .await
        .map_err(amqp_error("queue declare"))?;
    tracing::debug!("Declared durable queue: {queue}");
    Ok(())
}

/// Only an ack means the broker took responsibility for the message.
fn check_confirmation(queue: &str, confirmation: &Confirmation) -> Result<(), RpcError> {
    if confirmation.is_ack() {
        Ok(())
    } else if confirmation.is_nack() {
        Err(RpcError::Broker(format!(
            "amqp: broker rejected message for queue '{queue}'"
        )))
    } else {
        Err(RpcError::Broker(format!(
            "amqp: publish to '{queue}' was not confirmed (channel not in confirm mode)"
        )))
    }
}

async fn publish_on(channel: &Channel, queue: &str, message: OutboundMessage) -> Result<(), RpcError> {
    let mut properties = BasicProperties::default().with_content_type("application/json".into());
    if message.persistent {
        properties = properties.with_delivery_mode(2);
    }
    if let Some(id) = &message.correlation_id {
        properties = properties.with_correlation_id(id.as_str().into());
    }
    if let Some(reply_to) = &message.reply_to {
        properties = properties.with_reply_to(reply_to.as_str().into());
    }

    let confirmation = channel
        .basic_publish(
            "".into(),    // default exchange
            queue.into(), // routing key = queue name
            BasicPublishOptions::default(),
            &message.payload,
            properties,
        )
        .await
        .map_err(amqp_error("publish"))?
        .await
        .map_err(amqp_error("publish confirm"))?;
    check_confirmation(queue, &confirmation)?;

    tracing::debug!("Published to queue: {queue}");
    Ok(())
}

#[async_trait::async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), RpcError> {
        self.declare(queue).await?;
        publish_on(&self.channel, queue, message).await
    }

    async fn open_reply_channel(&self) -> Result<Box<dyn ReplyChannel>, RpcError> {
        let channel = open_confirmed_channel(&self.connection).await?;
        let consumer_tag = format!("conduit-reply-{}", CorrelationId::generate());
        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };
        let consumer = channel
            .basic_consume(
                DIRECT_REPLY_TO.into(),
                consumer_tag.as_str().into(),
                options,
                FieldTable::default(),
            )
            .await
            .map_err(amqp_error("consume"))?;

        Ok(Box::new(AmqpReplyChannel {
            channel,
            consumer,
            consumer_tag,
            declared: HashSet::new(),
        }))
    }

    async fn close(&self) -> Result<(), RpcError> {
        let _ = self.channel.close(200, "Normal shutdown".into()).await;
        self.connection
            .close(200, "Normal shutdown".into())
            .await
            .map_err(amqp_error("close"))?;
        tracing::info!("AMQP connection closed");
        Ok(())
    }
}

struct AmqpReplyChannel {
    channel: Channel,
    consumer: Consumer,
    consumer_tag: String,
    declared: HashSet<String>,
}

#[async_trait::async_trait]
impl ReplyChannel for AmqpReplyChannel {
    fn reply_to(&self) -> &str {
        DIRECT_REPLY_TO
    }

    async fn publish(&mut self, queue: &str, message: OutboundMessage) -> Result<(), RpcError> {
        if !queue.starts_with("amq.") && !self.declared.contains(queue) {
            declare_durable(&self.channel, queue).await?;
            self.declared.insert(queue.to_string());
        }
        publish_on(&self.channel, queue, message).await
    }

    async fn next_reply(&mut self) -> Result<Option<InboundMessage>, RpcError> {
        let Some(delivery) = self.consumer.next().await else {
            return Ok(None);
        };
        let delivery = delivery.map_err(amqp_error("consume"))?;
        let properties = &delivery.properties;
        Ok(Some(InboundMessage {
            correlation_id: properties
                .correlation_id()
                .as_ref()
                .map(|id| CorrelationId::from(id.as_str())),
            reply_to: properties.reply_to().as_ref().map(|r| r.as_str().to_string()),
            payload: Bytes::from(delivery.data),
        }))
    }

    async fn close(self: Box<Self>) -> Result<(), RpcError> {
        if let Err(e) = self
            .channel
            .basic_cancel(self.consumer_tag.as_str().into(), BasicCancelOptions::default())
            .await
        {
            tracing::debug!("Cancelling reply consumer failed: {e}");
        }
        self.channel
            .close(200, "Normal shutdown".into())
            .await
            .map_err(amqp_error("close channel"))
    }
}
