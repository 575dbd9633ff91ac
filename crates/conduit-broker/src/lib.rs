//! Broker-mediated RPC for Conduit.
//!
//! A request is published to a durable work queue with a correlation id and a
//! private reply address; the caller waits for the single reply carrying that
//! id. [`AmqpBroker`] talks to RabbitMQ, [`MemoryBroker`] runs in-process.

pub mod amqp;
pub mod broker;
pub mod config;
pub mod correlation;
pub mod memory;
pub mod rpc;
pub mod transport;

pub use amqp::AmqpBroker;
pub use broker::{
    Broker, BrokerPtr, DIRECT_REPLY_TO, InboundMessage, OutboundMessage, ReplyChannel,
};
pub use config::BrokerConfig;
pub use correlation::CorrelationId;
pub use memory::MemoryBroker;
pub use rpc::{BrokerRpc, RpcResponse, TaskMessage};
pub use transport::QueueTransport;
