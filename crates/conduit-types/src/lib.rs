//! Shared types, error hierarchy and request correlation for Conduit.

pub mod capabilities;
pub mod error;
pub mod registry;
pub mod transport;

pub use capabilities::*;
pub use error::{ConfigError, ErrorCode, RpcError, RpcErrorObject};
pub use registry::{CorrelationRegistry, PendingGuard, PendingHandle, lock_ignore_poison};
pub use transport::{RpcTransport, TransportPtr};
