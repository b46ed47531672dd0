//! WebSocket transport implementation for MCP client

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::{ConnectionConfig, duration_serde};
use crate::error::{McpClientError, McpClientResult};
use crate::transport::{
    ConnectionInfo, EventSender, Transport, TransportCapabilities, TransportEvent,
    TransportShared, TransportStatistics, TransportStatus, TransportType, header_metadata,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the socket went away without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// WebSocket-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Keep-alive ping period; zero disables pings
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    /// How long to wait for the pong before declaring the socket dead
    #[serde(with = "duration_serde")]
    pub pong_timeout: Duration,

    /// Largest frame `send()` accepts, in bytes
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            max_message_size: 10 * 1024 * 1024,
        }
    }
}

/// WebSocket transport for MCP client
pub struct WebSocketTransport {
    url: Url,
    config: WebSocketConfig,
    connection: ConnectionConfig,
    redact: bool,
    shared: TransportShared,
    /// Frames queued for the writer task of the live connection
    writer: Option<mpsc::UnboundedSender<Message>>,
    shutdown: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport for a `ws://` or `wss://` URL
    pub fn new(endpoint: &str) -> McpClientResult<Self> {
        let url = Url::parse(endpoint)
            .map_err(|e| McpClientError::connection_failed(format!("Invalid URL: {}", e)))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(McpClientError::unsupported_transport(format!(
                "Invalid scheme for WebSocket transport: {}",
                url.scheme()
            )));
        }

        Ok(Self {
            url,
            config: WebSocketConfig::default(),
            connection: ConnectionConfig::default(),
            redact: true,
            shared: TransportShared::default(),
            writer: None,
            shutdown: None,
            tasks: Vec::new(),
        })
    }

    pub fn with_config(mut self, config: WebSocketConfig) -> Self {
        self.config = config;
        self
    }

    /// Headers and credentials attached to the upgrade request
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Whether `connection_info()` masks credential headers
    pub fn with_redaction(mut self, redact: bool) -> Self {
        self.redact = redact;
        self
    }

    fn build_request(&self) -> McpClientResult<tungstenite::handshake::client::Request> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| McpClientError::connection_failed("Invalid upgrade request").with_cause(e))?;

        for (name, value) in self.connection.request_headers() {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                McpClientError::connection_failed(format!("Invalid header name '{}'", name))
                    .with_cause(e)
            })?;
            let value = HeaderValue::from_str(&value).map_err(|e| {
                McpClientError::connection_failed(format!("Invalid value for header '{}'", name))
                    .with_cause(e)
            })?;
            request.headers_mut().insert(name, value);
        }

        Ok(request)
    }

    /// Stop the tasks of the previous connection without reporting a disconnect
    fn stop_tasks(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.cancel();
        }
        self.writer = None;
        for task in self.tasks.drain(..) {
            if !task.is_finished() {
                task.abort();
            }
        }
    }
}

fn upgrade_error(error: tungstenite::Error) -> McpClientError {
    match error {
        tungstenite::Error::Http(response) => match response.status().as_u16() {
            401 => McpClientError::authentication("WebSocket upgrade rejected with 401"),
            403 => McpClientError::authorization("WebSocket upgrade rejected with 403"),
            status => McpClientError::connection_failed(format!(
                "WebSocket upgrade rejected with HTTP {}",
                status
            )),
        },
        other => McpClientError::connection_failed("WebSocket connection failed").with_cause(other),
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    trace!(error = %e, "Close frame not sent");
                }
                let _ = sink.close().await;
                break;
            }
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        debug!(error = %e, "WebSocket write failed");
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    writer: mpsc::UnboundedSender<Message>,
    shared: TransportShared,
    config: WebSocketConfig,
    shutdown: CancellationToken,
) {
    let ping_enabled = !config.ping_interval.is_zero();
    let period = if ping_enabled {
        config.ping_interval
    } else {
        Duration::from_secs(3600)
    };
    let mut ping_timer = tokio::time::interval_at(Instant::now() + period, period);
    let mut awaiting_pong: Option<Instant> = None;

    let (code, reason) = loop {
        let deadline = awaiting_pong.map(|sent| sent + config.pong_timeout);
        let pong_deadline = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ping_timer.tick(), if ping_enabled => {
                if awaiting_pong.is_none() {
                    trace!("Sending keep-alive ping");
                    if writer.send(Message::Ping(Bytes::new())).is_ok() {
                        awaiting_pong = Some(Instant::now());
                    }
                }
            }
            _ = pong_deadline => {
                warn!(timeout_ms = config.pong_timeout.as_millis() as u64, "No pong received");
                break (Some(ABNORMAL_CLOSURE), "pong timeout".to_string());
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    shared.record_received(text.len());
                    shared.emit(TransportEvent::Message(text.to_string()));
                }
                Some(Ok(Message::Binary(data))) => {
                    shared.record_received(data.len());
                    match String::from_utf8(data.to_vec()) {
                        Ok(text) => shared.emit(TransportEvent::Message(text)),
                        Err(_) => warn!(len = data.len(), "Dropping non UTF-8 binary frame"),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    trace!("Answering server ping");
                    let _ = writer.send(Message::Pong(data));
                }
                Some(Ok(Message::Pong(_))) => {
                    trace!("Pong received");
                    awaiting_pong = None;
                    shared.emit(TransportEvent::Heartbeat);
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, "closed by peer".to_string()),
                    };
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    shared.emit_error(
                        McpClientError::connection_closed("WebSocket read failed").with_cause(&e),
                        "websocket read",
                    );
                    break (Some(ABNORMAL_CLOSURE), e.to_string());
                }
                None => break (Some(ABNORMAL_CLOSURE), "stream ended".to_string()),
            }
        }
    };

    if shutdown.is_cancelled() {
        return;
    }
    shutdown.cancel();

    info!(code = ?code, reason = %reason, "WebSocket connection lost");
    shared.set_status(TransportStatus::Disconnected);
    shared.emit(TransportEvent::Disconnected { code, reason });
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            streaming: true,
            bidirectional: true,
            server_events: true,
            max_message_size: Some(self.config.max_message_size),
            persistent: true,
            resumable: false,
        }
    }

    fn status(&self) -> TransportStatus {
        self.shared.status()
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            transport_type: self.transport_type(),
            endpoint: self.url.to_string(),
            status: self.status(),
            capabilities: self.capabilities(),
            metadata: serde_json::json!({
                "scheme": self.url.scheme(),
                "host": self.url.host_str(),
                "port": self.url.port(),
                "ping_interval_ms": self.config.ping_interval.as_millis() as u64,
                "headers": header_metadata(&self.connection, self.redact),
            }),
        }
    }

    fn statistics(&self) -> TransportStatistics {
        self.shared.statistics()
    }

    fn set_event_sender(&mut self, sender: EventSender) {
        self.shared.set_sender(sender);
    }

    async fn connect(&mut self) -> McpClientResult<()> {
        match self.status() {
            TransportStatus::Closed => {
                return Err(McpClientError::invalid_state("Transport has been destroyed"));
            }
            TransportStatus::Connected => return Ok(()),
            _ => {}
        }

        self.stop_tasks();
        self.shared.set_status(TransportStatus::Connecting);
        debug!(url = %self.url, "Opening WebSocket connection");

        let request = match self.build_request() {
            Ok(request) => request,
            Err(e) => {
                self.shared.record_error(&e);
                self.shared.set_status(TransportStatus::Error);
                return Err(e);
            }
        };

        let (socket, _response) = match connect_async(request).await {
            Ok(connected) => connected,
            Err(e) => {
                let error = upgrade_error(e);
                warn!(url = %self.url, error = %error, "WebSocket connect failed");
                self.shared.record_error(&error);
                self.shared.set_status(TransportStatus::Error);
                return Err(error);
            }
        };

        let (sink, stream) = socket.split();
        let (writer, outbound) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        self.tasks.push(tokio::spawn(write_loop(sink, outbound, shutdown.clone())));
        self.tasks.push(tokio::spawn(read_loop(
            stream,
            writer.clone(),
            self.shared.clone(),
            self.config.clone(),
            shutdown.clone(),
        )));
        self.writer = Some(writer);
        self.shutdown = Some(shutdown);

        self.shared.record_connection();
        self.shared.set_status(TransportStatus::Connected);
        self.shared.emit(TransportEvent::Connected);
        info!(url = %self.url, "WebSocket transport connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> McpClientResult<()> {
        let was_connected = self.status() == TransportStatus::Connected;

        // Cancelling lets the writer send a close frame before it exits
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.cancel();
        }
        self.writer = None;
        for task in self.tasks.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }

        if self.status() != TransportStatus::Closed {
            self.shared.set_status(TransportStatus::Disconnected);
        }
        if was_connected {
            self.shared.emit(TransportEvent::Disconnected {
                code: Some(1000),
                reason: "client disconnect".to_string(),
            });
            info!(url = %self.url, "WebSocket transport disconnected");
        }
        Ok(())
    }

    async fn send(&mut self, message: &str) -> McpClientResult<()> {
        if self.status() != TransportStatus::Connected {
            return Err(McpClientError::not_connected());
        }
        if message.len() > self.config.max_message_size {
            return Err(McpClientError::message_too_large(
                message.len(),
                self.config.max_message_size,
            ));
        }

        let writer = self.writer.as_ref().ok_or_else(McpClientError::not_connected)?;
        writer
            .send(Message::Text(message.to_string().into()))
            .map_err(McpClientError::send_failed)?;

        self.shared.record_sent(message.len());
        Ok(())
    }

    async fn destroy(&mut self) {
        if self.status() == TransportStatus::Closed {
            return;
        }
        let _ = self.disconnect().await;
        self.shared.set_status(TransportStatus::Closed);
        debug!(url = %self.url, "WebSocket transport destroyed");
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}
