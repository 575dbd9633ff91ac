//! MCP (Model Context Protocol) client plumbing for Conduit.
//!
//! Tool servers run as child processes speaking newline-delimited JSON-RPC 2.0
//! over stdin/stdout. Requests are multiplexed over one stream and correlated
//! by id, so responses may arrive in any order. The `initialize` handshake is
//! schema-validated and requires an exact protocol version match.

pub mod client;
pub mod config;
pub mod connection;
pub mod framing;
pub mod jsonrpc;
pub mod negotiate;
pub mod schema;
pub mod transport;

pub use client::{McpClient, McpToolContent, McpToolInfo, McpToolResult};
pub use config::{McpConfig, McpServerConfig};
pub use connection::{ConnectionOptions, FramedConnection};
pub use framing::{DEFAULT_MAX_FRAME_BYTES, Demultiplexer, FeedReport, LineBuffer, ResponseRegistry};
pub use jsonrpc::{JsonRpcMessage, RequestId};
pub use negotiate::negotiate_protocol_version;
pub use transport::{ChildProcessTransport, ConnectionState};
