//! # MCP Client Library
//!
//! A resilient Model Context Protocol (MCP) client engine. It turns a raw,
//! possibly unreliable transport into a request/response and notification API
//! with automatic recovery.
//!
//! ## Features
//!
//! - **Transports**: WebSocket, Server-Sent Events with a POST side channel, and
//!   an in-process Local pair for tests and embedding
//! - **Connection state machine**: validated transitions with a timestamped history
//! - **Correlation**: per-request timeouts, exactly-once completion, bounded
//!   outbound queue while (re)connecting
//! - **Recovery**: exponential backoff with jitter and heartbeat liveness checks
//! - **Validation**: every inbound frame is checked before it reaches a caller
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether_mcp_client::{McpClientBuilder, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = McpClientBuilder::new()
//!         .with_url("ws://localhost:8080/mcp")?
//!         .build()?;
//!
//!     client.connect().await?;
//!
//!     for tool in client.tools() {
//!         println!("tool: {}", tool.name);
//!     }
//!
//!     let result = client
//!         .call_tool("echo", serde_json::json!({"text": "hi"}), RequestOptions::default())
//!         .await?;
//!     println!("{}", result.text());
//!
//!     client.destroy().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Events
//!
//! ```rust,no_run
//! # async fn demo(client: tether_mcp_client::McpClient) {
//! use tether_mcp_client::ClientEvent;
//!
//! let mut events = client.subscribe();
//! while let Ok(event) = events.recv().await {
//!     if let ClientEvent::Reconnecting { attempt, delay, .. } = event {
//!         println!("reconnect attempt {} in {:?}", attempt, delay);
//!     }
//! }
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod prelude;
pub mod state;
pub mod stats;
pub mod transport;

mod heartbeat;
mod pending;
mod queue;

// Re-export main types
pub use backoff::Backoff;
pub use client::{ClientRequest, ConnectionStatus, McpClient, McpClientBuilder, RequestOptions};
pub use config::{
    ClientConfig, ConnectionConfig, HeartbeatConfig, HeartbeatMode, LimitsConfig, LoggingConfig,
    ReconnectConfig, TimeoutConfig,
};
pub use error::{ErrorCategory, ErrorKind, ErrorSeverity, McpClientError, McpClientResult, codes};
pub use events::{ClientEvent, EventBus, SubscriptionId};
pub use state::{ClientStatus, StatusHistory, StatusTransition};
pub use stats::ClientStatistics;

// Re-export transport types
pub use transport::{
    ConnectionInfo, Transport, TransportEvent, TransportFactory, TransportStatistics,
    TransportStatus, TransportType,
};

// Re-export protocol types for convenience
pub use tether_mcp_protocol::*;
