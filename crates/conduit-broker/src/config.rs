//! Broker connection settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BROKER_URI: &str = "amqp://localhost:5672/%2f";
pub const DEFAULT_TASK_QUEUE: &str = "long_running_tasks";

fn default_uri() -> String {
    DEFAULT_BROKER_URI.to_string()
}

fn default_reply_timeout() -> u64 {
    30000
}

fn default_task_queue() -> String {
    DEFAULT_TASK_QUEUE.to_string()
}

/// How to reach the broker and how long to wait for replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// AMQP URI, including credentials and vhost.
    #[serde(default = "default_uri")]
    pub uri: String,
    /// How long a call waits for its reply, in milliseconds.
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,
    /// Queue that receives fire-and-forget long-running tasks.
    #[serde(default = "default_task_queue")]
    pub task_queue: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            reply_timeout_ms: default_reply_timeout(),
            task_queue: default_task_queue(),
        }
    }
}

impl BrokerConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}
