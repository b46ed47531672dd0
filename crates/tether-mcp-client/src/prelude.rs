//! # MCP Client Prelude
//!
//! Re-exports of the types most programs need.
//!
//! ```rust
//! use tether_mcp_client::prelude::*;
//! ```

// Core client types
pub use crate::client::{ClientRequest, ConnectionStatus, McpClient, McpClientBuilder, RequestOptions};
pub use crate::config::{
    ClientConfig, ConnectionConfig, HeartbeatConfig, HeartbeatMode, LimitsConfig, LoggingConfig,
    ReconnectConfig, TimeoutConfig,
};
pub use crate::error::{ErrorKind, McpClientError, McpClientResult, codes};
pub use crate::events::{ClientEvent, SubscriptionId};
pub use crate::state::ClientStatus;

// Transport types
pub use crate::transport::{
    LocalPeer, LocalTransport, SseTransport, Transport, TransportFactory, TransportType,
    WebSocketTransport,
};

// Re-export protocol types for convenience
pub use tether_mcp_protocol::prelude::*;

// Standard library types commonly used with MCP
pub use std::time::Duration;
