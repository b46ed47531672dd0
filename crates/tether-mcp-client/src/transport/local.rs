//! In-process transport pair
//!
//! [`LocalTransport::pair`] returns the client half and a [`LocalPeer`] that
//! plays the server: it sees every frame the client sends, can push frames
//! back, drop the connection and refuse new ones. Event semantics match the
//! network transports.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{McpClientError, McpClientResult};
use crate::transport::{
    ConnectionInfo, EventSender, Transport, TransportCapabilities, TransportEvent,
    TransportShared, TransportStatistics, TransportStatus, TransportType,
};

struct LocalLink {
    shared: TransportShared,
    refuse: AtomicBool,
    connect_delay: Mutex<Duration>,
    connects: AtomicU64,
    to_peer: mpsc::UnboundedSender<String>,
}

/// Client half of an in-process connection
pub struct LocalTransport {
    link: Arc<LocalLink>,
}

/// Server half of an in-process connection
#[derive(Clone)]
pub struct LocalPeer {
    link: Arc<LocalLink>,
    inbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
}

impl LocalTransport {
    pub fn pair() -> (LocalTransport, LocalPeer) {
        let (to_peer, inbound) = mpsc::unbounded_channel();
        let link = Arc::new(LocalLink {
            shared: TransportShared::default(),
            refuse: AtomicBool::new(false),
            connect_delay: Mutex::new(Duration::ZERO),
            connects: AtomicU64::new(0),
            to_peer,
        });

        (
            LocalTransport {
                link: Arc::clone(&link),
            },
            LocalPeer {
                link,
                inbound: Arc::new(tokio::sync::Mutex::new(inbound)),
            },
        )
    }
}

impl LocalPeer {
    /// Next frame sent by the client, waiting for one to arrive
    pub async fn recv(&self) -> Option<String> {
        self.inbound.lock().await.recv().await
    }

    /// Next frame sent by the client, parsed as JSON
    pub async fn recv_json(&self) -> Option<Value> {
        let frame = self.recv().await?;
        serde_json::from_str(&frame).ok()
    }

    pub fn try_recv(&self) -> Option<String> {
        self.inbound.try_lock().ok()?.try_recv().ok()
    }

    /// Deliver a frame to the client; returns false while disconnected
    pub fn push(&self, message: impl Into<String>) -> bool {
        if !self.is_connected() {
            return false;
        }
        let message = message.into();
        trace!(len = message.len(), "Local peer pushing frame");
        self.link.shared.record_received(message.len());
        self.link.shared.emit(TransportEvent::Message(message));
        true
    }

    pub fn push_json(&self, message: &Value) -> bool {
        self.push(message.to_string())
    }

    /// Emit a transport-level liveness signal
    pub fn heartbeat(&self) {
        self.link.shared.emit(TransportEvent::Heartbeat);
    }

    /// Drop the connection as if the network failed
    pub fn drop_connection(&self, code: Option<u16>, reason: impl Into<String>) {
        if !self.is_connected() {
            return;
        }
        let reason = reason.into();
        debug!(code = ?code, reason = %reason, "Local peer dropping connection");
        self.link.shared.set_status(TransportStatus::Disconnected);
        self.link
            .shared
            .emit(TransportEvent::Disconnected { code, reason });
    }

    /// While set, every `connect()` fails
    pub fn refuse_connections(&self, refuse: bool) {
        self.link.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make every `connect()` take this long before it resolves
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.link.connect_delay.lock() = delay;
    }

    pub fn is_connected(&self) -> bool {
        self.link.shared.status() == TransportStatus::Connected
    }

    pub fn status(&self) -> TransportStatus {
        self.link.shared.status()
    }

    /// Connection attempts seen, successful or not
    pub fn connect_attempts(&self) -> u64 {
        self.link.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Local
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            streaming: true,
            bidirectional: true,
            server_events: true,
            max_message_size: None,
            persistent: true,
            resumable: false,
        }
    }

    fn status(&self) -> TransportStatus {
        self.link.shared.status()
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            transport_type: self.transport_type(),
            endpoint: "local".to_string(),
            status: self.status(),
            capabilities: self.capabilities(),
            metadata: serde_json::json!({
                "connect_attempts": self.link.connects.load(Ordering::SeqCst),
            }),
        }
    }

    fn statistics(&self) -> TransportStatistics {
        self.link.shared.statistics()
    }

    fn set_event_sender(&mut self, sender: EventSender) {
        self.link.shared.set_sender(sender);
    }

    async fn connect(&mut self) -> McpClientResult<()> {
        let shared = &self.link.shared;
        match shared.status() {
            TransportStatus::Closed => {
                return Err(McpClientError::invalid_state("Transport has been destroyed"));
            }
            TransportStatus::Connected => return Ok(()),
            _ => {}
        }

        self.link.connects.fetch_add(1, Ordering::SeqCst);
        shared.set_status(TransportStatus::Connecting);

        let delay = *self.link.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.link.refuse.load(Ordering::SeqCst) {
            let error = McpClientError::connection_failed("Local peer refused the connection");
            shared.record_error(&error);
            shared.set_status(TransportStatus::Error);
            return Err(error);
        }

        shared.record_connection();
        shared.set_status(TransportStatus::Connected);
        shared.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> McpClientResult<()> {
        let shared = &self.link.shared;
        let was_connected = shared.status() == TransportStatus::Connected;
        if shared.status() != TransportStatus::Closed {
            shared.set_status(TransportStatus::Disconnected);
        }
        if was_connected {
            shared.emit(TransportEvent::Disconnected {
                code: Some(1000),
                reason: "client disconnect".to_string(),
            });
        }
        Ok(())
    }

    async fn send(&mut self, message: &str) -> McpClientResult<()> {
        if self.status() != TransportStatus::Connected {
            return Err(McpClientError::not_connected());
        }
        self.link
            .to_peer
            .send(message.to_string())
            .map_err(|_| McpClientError::send_failed("local peer is gone"))?;
        self.link.shared.record_sent(message.len());
        Ok(())
    }

    async fn destroy(&mut self) {
        if self.status() == TransportStatus::Closed {
            return;
        }
        let _ = self.disconnect().await;
        self.link.shared.set_status(TransportStatus::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (mut transport, peer) = LocalTransport::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_event_sender(tx);

        assert!(!peer.push("{}"));
        transport.connect().await.unwrap();
        transport.send(r#"{"jsonrpc":"2.0","method":"ping"}"#).await.unwrap();

        let frame = peer.recv_json().await.unwrap();
        assert_eq!(frame["method"], "ping");

        assert!(peer.push(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#));

        let mut saw_connected = false;
        let mut saw_message = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                TransportEvent::Connected => saw_connected = true,
                TransportEvent::Message(text) => saw_message = text.contains("result"),
                _ => {}
            }
        }
        assert!(saw_connected);
        assert!(saw_message);
        assert_eq!(transport.statistics().messages_sent, 1);
        assert_eq!(transport.statistics().messages_received, 1);
    }

    #[tokio::test]
    async fn test_refused_connection_sets_error() {
        let (mut transport, peer) = LocalTransport::pair();
        peer.refuse_connections(true);

        let err = transport.connect().await.unwrap_err();
        assert_eq!(err.code, codes::CONNECTION_FAILED);
        assert_eq!(transport.status(), TransportStatus::Error);
        assert_eq!(peer.connect_attempts(), 1);

        peer.refuse_connections(false);
        transport.connect().await.unwrap();
        assert!(peer.is_connected());
    }

    #[tokio::test]
    async fn test_peer_drop_reports_disconnect() {
        let (mut transport, peer) = LocalTransport::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_event_sender(tx);
        transport.connect().await.unwrap();

        peer.drop_connection(Some(1006), "gone");
        assert_eq!(transport.status(), TransportStatus::Disconnected);

        let disconnected = std::iter::from_fn(|| rx.try_recv().ok())
            .find(|event| matches!(event, TransportEvent::Disconnected { .. }));
        assert!(matches!(
            disconnected,
            Some(TransportEvent::Disconnected { code: Some(1006), .. })
        ));

        let err = transport.send("{}").await.unwrap_err();
        assert_eq!(err.code, codes::NOT_CONNECTED);
    }

    #[tokio::test]
    async fn test_destroy_is_final() {
        let (mut transport, _peer) = LocalTransport::pair();
        transport.connect().await.unwrap();
        transport.destroy().await;
        transport.destroy().await;

        assert_eq!(transport.status(), TransportStatus::Closed);
        assert!(transport.connect().await.is_err());
    }
}
