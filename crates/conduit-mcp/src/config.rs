//! Configuration types for MCP servers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::connection::ConnectionOptions;
use crate::framing::DEFAULT_MAX_FRAME_BYTES;

fn default_timeout() -> u64 {
    30000
}

fn default_ready_delay() -> u64 {
    50
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

/// Top-level MCP configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,
}

/// Configuration for a single MCP server subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Command to run (e.g., "bun", "python").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-request timeout in milliseconds (default: 30000, 0 disables).
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Grace period after spawning before the process counts as alive (default: 50).
    #[serde(default = "default_ready_delay")]
    pub ready_delay_ms: u64,
    /// Largest accepted frame on the server's stdout, in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl McpServerConfig {
    /// A config for `command` with every other field at its default.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout_ms: default_timeout(),
            ready_delay_ms: default_ready_delay(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn ready_delay(&self) -> Duration {
        Duration::from_millis(self.ready_delay_ms)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            request_timeout: self.request_timeout(),
            max_frame_bytes: self.max_frame_bytes,
            ..ConnectionOptions::default()
        }
    }
}
