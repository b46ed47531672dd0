//! Transport layer for MCP client
//!
//! A transport moves serialized JSON-RPC frames and reports everything else
//! through [`TransportEvent`]s on a channel handed over by the client with
//! [`Transport::set_event_sender`]. The sender outlives individual
//! connections, so the same transport can be disconnected and connected again.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

use crate::config::ClientConfig;
use crate::error::{McpClientError, McpClientResult};

pub mod local;
pub mod sse;
pub mod websocket;

pub use local::{LocalPeer, LocalTransport};
pub use sse::{SseConfig, SseTransport};
pub use websocket::{WebSocketConfig, WebSocketTransport};

/// Transport type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    /// Full-duplex WebSocket
    WebSocket,
    /// Server push over Server-Sent Events with a POST side channel
    Sse,
    /// In-process pair, no network
    Local,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::WebSocket => write!(f, "WebSocket"),
            TransportType::Sse => write!(f, "SSE"),
            TransportType::Local => write!(f, "Local"),
        }
    }
}

/// Lifecycle of a single transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
    /// Reached through `destroy()`; the transport cannot connect again
    Closed,
}

impl std::fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportStatus::Idle => "idle",
            TransportStatus::Connecting => "connecting",
            TransportStatus::Connected => "connected",
            TransportStatus::Disconnected => "disconnected",
            TransportStatus::Error => "error",
            TransportStatus::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Transport capabilities
#[derive(Debug, Clone, Serialize)]
pub struct TransportCapabilities {
    /// Whether the transport supports streaming responses
    pub streaming: bool,
    /// Whether the transport supports bidirectional communication
    pub bidirectional: bool,
    /// Whether the transport supports server-initiated events
    pub server_events: bool,
    /// Maximum message size (if applicable)
    pub max_message_size: Option<usize>,
    /// Whether the transport maintains persistent connections
    pub persistent: bool,
    /// Whether the transport resumes a dropped stream on its own
    pub resumable: bool,
}

/// Transport connection information
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub transport_type: TransportType,
    pub endpoint: String,
    pub status: TransportStatus,
    pub capabilities: TransportCapabilities,
    /// Transport-specific details; credential headers are masked when redaction is on
    pub metadata: Value,
}

/// Everything a transport reports besides the result of `send()`
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    /// `code` follows WebSocket close codes; 1006 marks an unclean drop
    Disconnected { code: Option<u16>, reason: String },
    /// One inbound frame, not yet validated
    Message(String),
    Error {
        error: McpClientError,
        context: String,
    },
    StatusChange {
        old: TransportStatus,
        new: TransportStatus,
    },
    /// The transport is resuming its stream on its own
    Reconnecting { attempt: u32, delay: Duration },
    /// Liveness signal below the MCP layer
    Heartbeat,
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport statistics for monitoring
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStatistics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    /// Connections opened, including resumptions
    pub connections: u64,
    pub last_error: Option<String>,
}

/// Transport trait defining the interface for all transport implementations
#[async_trait]
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    fn capabilities(&self) -> TransportCapabilities;

    fn status(&self) -> TransportStatus;

    fn connection_info(&self) -> ConnectionInfo;

    fn statistics(&self) -> TransportStatistics;

    /// Install the channel every [`TransportEvent`] is sent on
    fn set_event_sender(&mut self, sender: EventSender);

    /// Open the connection; resolves once frames can be sent
    async fn connect(&mut self) -> McpClientResult<()>;

    /// Close the connection; a later `connect()` starts over
    async fn disconnect(&mut self) -> McpClientResult<()>;

    /// Send one serialized frame
    async fn send(&mut self, message: &str) -> McpClientResult<()>;

    /// Close for good; any later `connect()` fails
    async fn destroy(&mut self);

    fn is_connected(&self) -> bool {
        self.status() == TransportStatus::Connected
    }
}

/// Type alias for a boxed transport
pub type BoxedTransport = Box<dyn Transport>;

/// Status, statistics and event sender shared between a transport and its
/// background tasks
#[derive(Clone, Default)]
pub(crate) struct TransportShared {
    inner: Arc<SharedInner>,
}

struct SharedInner {
    status: Mutex<TransportStatus>,
    stats: Mutex<TransportStatistics>,
    sender: Mutex<Option<EventSender>>,
}

impl Default for SharedInner {
    fn default() -> Self {
        Self {
            status: Mutex::new(TransportStatus::Idle),
            stats: Mutex::new(TransportStatistics::default()),
            sender: Mutex::new(None),
        }
    }
}

impl TransportShared {
    pub(crate) fn status(&self) -> TransportStatus {
        *self.inner.status.lock()
    }

    /// Move to `new`, emitting `StatusChange` when it differs; `Closed` is sticky
    pub(crate) fn set_status(&self, new: TransportStatus) -> TransportStatus {
        let old = {
            let mut status = self.inner.status.lock();
            let old = *status;
            if old == TransportStatus::Closed || old == new {
                return old;
            }
            *status = new;
            old
        };
        trace!(%old, %new, "Transport status changed");
        self.emit(TransportEvent::StatusChange { old, new });
        old
    }

    pub(crate) fn set_sender(&self, sender: EventSender) {
        *self.inner.sender.lock() = Some(sender);
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let sender = self.inner.sender.lock().clone();
        match sender {
            Some(sender) => {
                if sender.send(event).is_err() {
                    debug!("Transport event receiver dropped");
                }
            }
            None => trace!(?event, "No event sender installed"),
        }
    }

    pub(crate) fn emit_error(&self, error: McpClientError, context: impl Into<String>) {
        self.record_error(&error);
        self.emit(TransportEvent::Error {
            error,
            context: context.into(),
        });
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        let mut stats = self.inner.stats.lock();
        stats.messages_sent += 1;
        stats.bytes_sent += bytes as u64;
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        let mut stats = self.inner.stats.lock();
        stats.messages_received += 1;
        stats.bytes_received += bytes as u64;
    }

    pub(crate) fn record_connection(&self) {
        self.inner.stats.lock().connections += 1;
    }

    pub(crate) fn record_error(&self, error: &McpClientError) {
        let mut stats = self.inner.stats.lock();
        stats.errors += 1;
        stats.last_error = Some(error.to_string());
    }

    pub(crate) fn statistics(&self) -> TransportStatistics {
        self.inner.stats.lock().clone()
    }
}

/// Helper function to detect transport type from URL
pub fn detect_transport_type(url_str: &str) -> McpClientResult<TransportType> {
    let url = Url::parse(url_str)
        .map_err(|e| McpClientError::connection_failed(format!("Invalid URL: {}", e)))?;

    match url.scheme() {
        "ws" | "wss" => Ok(TransportType::WebSocket),
        "http" | "https" => Ok(TransportType::Sse),
        scheme => Err(McpClientError::unsupported_transport(format!(
            "Unknown scheme: {}",
            scheme
        ))),
    }
}

/// Transport factory for creating transport instances
pub struct TransportFactory;

impl TransportFactory {
    /// Create a transport from URL string
    pub fn from_url(url: &str) -> McpClientResult<BoxedTransport> {
        Self::from_url_with_config(url, &ClientConfig::default())
    }

    /// Create a transport from URL string, applying the transport, connection and
    /// logging settings
    pub fn from_url_with_config(url: &str, config: &ClientConfig) -> McpClientResult<BoxedTransport> {
        let connection = config.connection.clone();
        let redact = config.logging.redact_sensitive;

        match detect_transport_type(url)? {
            TransportType::WebSocket => Ok(Box::new(
                WebSocketTransport::new(url)?
                    .with_config(config.websocket.clone())
                    .with_connection(connection)
                    .with_redaction(redact),
            )),
            TransportType::Sse => Ok(Box::new(
                SseTransport::new(url)?
                    .with_config(config.sse.clone())
                    .with_connection(connection)
                    .with_redaction(redact),
            )),
            TransportType::Local => Err(McpClientError::unsupported_transport(
                "Local transports are created with LocalTransport::pair()",
            )),
        }
    }

    /// List transport types reachable through a URL
    pub fn available_transports() -> Vec<TransportType> {
        vec![TransportType::WebSocket, TransportType::Sse]
    }
}

/// Header map shown in `connection_info()`
pub(crate) fn header_metadata(connection: &crate::config::ConnectionConfig, redact: bool) -> Value {
    serde_json::to_value(connection.display_headers(redact)).unwrap_or(Value::Null)
}
