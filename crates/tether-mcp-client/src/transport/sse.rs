//! SSE (Server-Sent Events) transport implementation for MCP client
//!
//! Server push arrives on a long-lived `GET` with `Accept: text/event-stream`.
//! Outbound frames are POSTed to a side channel that is either configured up
//! front or announced by the server in an `endpoint` event. When the stream
//! drops, the transport can resume it with `Last-Event-ID` before reporting
//! the disconnect.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::{ConnectionConfig, duration_serde};
use crate::error::{McpClientError, McpClientResult, codes};
use crate::transport::{
    ConnectionInfo, EventSender, Transport, TransportCapabilities, TransportEvent,
    TransportShared, TransportStatistics, TransportStatus, TransportType, header_metadata,
};

/// SSE-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SseConfig {
    /// Side channel for outbound frames, absolute or relative to the stream URL
    pub post_endpoint: Option<String>,

    /// Re-GETs attempted after the stream drops; zero reports the drop at once
    pub max_resume_attempts: u32,

    /// Wait before a resume attempt unless the server sent a `retry:` hint
    #[serde(with = "duration_serde")]
    pub resume_delay: Duration,

    /// Timeout for each side-channel POST
    #[serde(with = "duration_serde")]
    pub post_timeout: Duration,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            post_endpoint: None,
            max_resume_attempts: 0,
            resume_delay: Duration::from_secs(1),
            post_timeout: Duration::from_secs(30),
        }
    }
}

/// One parsed event block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<Duration>,
}

/// Parse one SSE event block (the text between blank lines)
///
/// Returns `None` for blocks holding only comments.
pub fn parse_sse_event(event_text: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data_lines: Vec<&str> = Vec::new();
    let mut seen_field = false;

    for line in event_text.split(['\r', '\n']) {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        seen_field = true;

        match field {
            "event" => event.event = Some(value.to_string()),
            "data" => data_lines.push(value),
            "id" if !value.contains('\0') => event.id = Some(value.to_string()),
            "retry" => {
                if let Ok(millis) = value.trim().parse::<u64>() {
                    event.retry = Some(Duration::from_millis(millis));
                }
            }
            other => trace!(field = other, "Ignoring unknown SSE field"),
        }
    }

    if !seen_field {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

/// Byte buffer that yields complete event blocks
///
/// Line endings (`\r\n`, `\n` or a lone `\r`) are folded to `\n` as bytes
/// arrive, so a terminator split across chunks is still recognised. Blocks
/// are decoded only once complete, keeping multi-byte characters intact.
#[derive(Debug, Default)]
pub(crate) struct EventBuffer {
    bytes: BytesMut,
    after_cr: bool,
}

impl EventBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.bytes.reserve(chunk.len());
        for &byte in chunk {
            match byte {
                b'\n' if self.after_cr => self.after_cr = false,
                b'\r' => {
                    self.bytes.extend_from_slice(b"\n");
                    self.after_cr = true;
                }
                _ => {
                    self.bytes.extend_from_slice(&[byte]);
                    self.after_cr = false;
                }
            }
        }
    }

    /// Next complete block, without its terminating blank line
    pub(crate) fn next_block(&mut self) -> Option<Result<String, std::string::FromUtf8Error>> {
        let end = self.bytes.windows(2).position(|pair| pair == b"\n\n")?;
        let block = self.bytes.split_to(end).to_vec();
        self.bytes.advance(2);
        Some(String::from_utf8(block))
    }
}

/// SSE transport for MCP client
pub struct SseTransport {
    client: Client,
    stream_url: Url,
    config: SseConfig,
    connection: ConnectionConfig,
    redact: bool,
    shared: TransportShared,
    post_endpoint: Arc<Mutex<Option<Url>>>,
    shutdown: Option<CancellationToken>,
    stream_task: Option<JoinHandle<()>>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    post_task: Option<JoinHandle<()>>,
}

/// Everything the stream task needs, detached from the transport
#[derive(Clone)]
struct StreamContext {
    client: Client,
    url: Url,
    headers: Vec<(String, String)>,
    shared: TransportShared,
    post_endpoint: Arc<Mutex<Option<Url>>>,
    config: SseConfig,
}

impl SseTransport {
    /// Create a new SSE transport for an `http://` or `https://` stream URL
    pub fn new(endpoint: &str) -> McpClientResult<Self> {
        let url = Url::parse(endpoint)
            .map_err(|e| McpClientError::connection_failed(format!("Invalid URL: {}", e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(McpClientError::unsupported_transport(format!(
                "Invalid scheme for SSE transport: {}",
                url.scheme()
            )));
        }

        let client = Client::builder().build().map_err(|e| {
            McpClientError::connection_failed("Failed to create HTTP client").with_cause(e)
        })?;

        Ok(Self {
            client,
            stream_url: url,
            config: SseConfig::default(),
            connection: ConnectionConfig::default(),
            redact: true,
            shared: TransportShared::default(),
            post_endpoint: Arc::new(Mutex::new(None)),
            shutdown: None,
            stream_task: None,
            outbound: None,
            post_task: None,
        })
    }

    pub fn with_config(mut self, config: SseConfig) -> Self {
        self.config = config;
        self
    }

    /// Headers and credentials attached to the stream and side-channel requests
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_redaction(mut self, redact: bool) -> Self {
        self.redact = redact;
        self
    }

    /// Side channel currently in use, if any
    pub fn post_endpoint(&self) -> Option<Url> {
        self.post_endpoint.lock().clone()
    }

    fn configured_post_endpoint(&self) -> McpClientResult<Option<Url>> {
        self.config
            .post_endpoint
            .as_deref()
            .map(|endpoint| {
                self.stream_url.join(endpoint).map_err(|e| {
                    McpClientError::connection_failed(format!(
                        "Invalid POST endpoint '{}'",
                        endpoint
                    ))
                    .with_cause(e)
                })
            })
            .transpose()
    }

    fn context(&self) -> StreamContext {
        StreamContext {
            client: self.client.clone(),
            url: self.stream_url.clone(),
            headers: self.connection.request_headers(),
            shared: self.shared.clone(),
            post_endpoint: Arc::clone(&self.post_endpoint),
            config: self.config.clone(),
        }
    }

    fn stop_stream(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.cancel();
        }
        if let Some(handle) = self.stream_task.take() {
            handle.abort();
        }
        self.outbound = None;
        if let Some(handle) = self.post_task.take() {
            handle.abort();
        }
    }

    fn fail(&self, error: McpClientError) -> McpClientError {
        self.shared.record_error(&error);
        self.shared.set_status(TransportStatus::Error);
        error
    }
}

fn status_error(status: StatusCode, what: &str) -> McpClientError {
    match status {
        StatusCode::UNAUTHORIZED => {
            McpClientError::authentication(format!("{} rejected with 401", what))
        }
        StatusCode::FORBIDDEN => McpClientError::authorization(format!("{} rejected with 403", what)),
        other => McpClientError::connection_failed(format!("{} returned HTTP {}", what, other)),
    }
}

async fn open_stream(ctx: &StreamContext, last_event_id: Option<&str>) -> McpClientResult<Response> {
    let mut request = ctx
        .client
        .get(ctx.url.clone())
        .header("Accept", "text/event-stream")
        .header("Cache-Control", "no-cache");
    for (name, value) in &ctx.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(id) = last_event_id {
        request = request.header("Last-Event-ID", id);
    }

    let response = request.send().await.map_err(|e| {
        McpClientError::connection_failed("Failed to open SSE stream").with_cause(e)
    })?;

    if !response.status().is_success() {
        return Err(status_error(response.status(), "SSE stream"));
    }
    Ok(response)
}

/// Cursor state that survives stream resumption
#[derive(Debug, Default)]
struct ResumeState {
    last_event_id: Option<String>,
    retry_hint: Option<Duration>,
}

fn dispatch_event(ctx: &StreamContext, event: SseEvent, resume: &mut ResumeState) {
    if let Some(id) = event.id {
        resume.last_event_id = Some(id);
    }
    if let Some(retry) = event.retry {
        resume.retry_hint = Some(retry);
    }

    match event.event.as_deref() {
        Some("endpoint") => match ctx.url.join(event.data.trim()) {
            Ok(endpoint) => {
                debug!(endpoint = %endpoint, "Server announced POST endpoint");
                *ctx.post_endpoint.lock() = Some(endpoint);
            }
            Err(e) => warn!(error = %e, data = %event.data, "Ignoring invalid endpoint event"),
        },
        Some("ping") | Some("heartbeat") => ctx.shared.emit(TransportEvent::Heartbeat),
        None | Some("message") | Some("notification") | Some("request") => {
            if event.data.is_empty() {
                return;
            }
            ctx.shared.record_received(event.data.len());
            ctx.shared.emit(TransportEvent::Message(event.data));
        }
        Some(other) => debug!(event_type = other, "Unknown SSE event type"),
    }
}

/// Read events until the stream ends; `None` means shutdown was requested
async fn read_stream(
    ctx: &StreamContext,
    response: Response,
    resume: &mut ResumeState,
    shutdown: &CancellationToken,
) -> Option<String> {
    let mut stream = response.bytes_stream();
    let mut buffer = EventBuffer::default();

    loop {
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => return None,
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                buffer.push(&bytes);
                while let Some(block) = buffer.next_block() {
                    match block {
                        Ok(event_text) => {
                            if let Some(event) = parse_sse_event(&event_text) {
                                dispatch_event(ctx, event, resume);
                            }
                        }
                        Err(e) => ctx.shared.emit_error(
                            McpClientError::protocol(codes::PARSE_ERROR, "SSE event is not valid UTF-8")
                                .with_cause(e),
                            "sse stream",
                        ),
                    }
                }
            }
            Some(Err(e)) => {
                ctx.shared.emit_error(
                    McpClientError::connection_closed("SSE stream error").with_cause(&e),
                    "sse stream",
                );
                return Some(e.to_string());
            }
            None => return Some("stream ended".to_string()),
        }
    }
}

/// POST one outbound frame; a JSON reply body is surfaced as an inbound message
async fn post_frame(ctx: &StreamContext, message: &str) -> McpClientResult<()> {
    let endpoint = ctx.post_endpoint.lock().clone();
    let Some(endpoint) = endpoint else {
        warn!("SSE transport has no POST endpoint; outbound message dropped");
        return Ok(());
    };

    let mut request = ctx
        .client
        .post(endpoint)
        .timeout(ctx.config.post_timeout)
        .header("Content-Type", "application/json")
        .header("Accept", "application/json, text/event-stream");
    for (name, value) in &ctx.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request
        .body(message.to_string())
        .send()
        .await
        .map_err(McpClientError::send_failed)?;

    let status = response.status();
    if !status.is_success() {
        return Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => status_error(status, "POST"),
            other => McpClientError::send_failed(format!("POST returned HTTP {}", other)),
        });
    }
    ctx.shared.record_sent(message.len());

    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));
    if is_json {
        match response.text().await {
            Ok(body) if !body.trim().is_empty() => {
                ctx.shared.record_received(body.len());
                ctx.shared.emit(TransportEvent::Message(body));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to read POST response body"),
        }
    }
    Ok(())
}

/// Drain outbound frames in order, one POST at a time
async fn post_loop(
    ctx: StreamContext,
    mut frames: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => return,
            message = frames.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };

        let posted = tokio::select! {
            _ = shutdown.cancelled() => return,
            posted = post_frame(&ctx, &message) => posted,
        };
        if let Err(error) = posted {
            warn!(error = %error, "SSE POST failed");
            ctx.shared.emit_error(error, "sse post");
        }
    }
}

async fn stream_loop(ctx: StreamContext, first: Response, shutdown: CancellationToken) {
    let mut response = first;
    let mut resume = ResumeState::default();

    loop {
        let Some(reason) = read_stream(&ctx, response, &mut resume, &shutdown).await else {
            return;
        };
        warn!(reason = %reason, "SSE stream dropped");

        let mut resumed = None;
        for attempt in 1..=ctx.config.max_resume_attempts {
            let delay = resume.retry_hint.unwrap_or(ctx.config.resume_delay);
            ctx.shared.emit(TransportEvent::Reconnecting { attempt, delay });
            info!(attempt, delay_ms = delay.as_millis() as u64, "Resuming SSE stream");

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match open_stream(&ctx, resume.last_event_id.as_deref()).await {
                Ok(next) => {
                    resumed = Some(next);
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "SSE resume attempt failed");
                    ctx.shared.record_error(&e);
                }
            }
        }

        match resumed {
            Some(next) => {
                ctx.shared.record_connection();
                response = next;
            }
            None => {
                if shutdown.is_cancelled() {
                    return;
                }
                shutdown.cancel();
                ctx.shared.set_status(TransportStatus::Disconnected);
                ctx.shared.emit(TransportEvent::Disconnected {
                    code: Some(super::websocket::ABNORMAL_CLOSURE),
                    reason,
                });
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Sse
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            streaming: true,
            bidirectional: false,
            server_events: true,
            max_message_size: None,
            persistent: true,
            resumable: self.config.max_resume_attempts > 0,
        }
    }

    fn status(&self) -> TransportStatus {
        self.shared.status()
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            transport_type: self.transport_type(),
            endpoint: self.stream_url.to_string(),
            status: self.status(),
            capabilities: self.capabilities(),
            metadata: serde_json::json!({
                "stream_endpoint": self.stream_url.to_string(),
                "post_endpoint": self.post_endpoint().map(|url| url.to_string()),
                "scheme": self.stream_url.scheme(),
                "host": self.stream_url.host_str(),
                "port": self.stream_url.port(),
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

        self.stop_stream();
        self.shared.set_status(TransportStatus::Connecting);

        let configured = self.configured_post_endpoint().map_err(|e| self.fail(e))?;
        *self.post_endpoint.lock() = configured;

        debug!(url = %self.stream_url, "Opening SSE stream");
        let ctx = self.context();
        let response = open_stream(&ctx, None).await.map_err(|e| {
            warn!(url = %self.stream_url, error = %e, "SSE connect failed");
            self.fail(e)
        })?;

        let shutdown = CancellationToken::new();
        let (outbound, frames) = mpsc::unbounded_channel();
        self.post_task = Some(tokio::spawn(post_loop(ctx.clone(), frames, shutdown.clone())));
        self.stream_task = Some(tokio::spawn(stream_loop(ctx, response, shutdown.clone())));
        self.outbound = Some(outbound);
        self.shutdown = Some(shutdown);

        self.shared.record_connection();
        self.shared.set_status(TransportStatus::Connected);
        self.shared.emit(TransportEvent::Connected);
        info!(url = %self.stream_url, "SSE transport connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> McpClientResult<()> {
        let was_connected = self.status() == TransportStatus::Connected;
        self.stop_stream();

        if self.status() != TransportStatus::Closed {
            self.shared.set_status(TransportStatus::Disconnected);
        }
        if was_connected {
            self.shared.emit(TransportEvent::Disconnected {
                code: Some(1000),
                reason: "client disconnect".to_string(),
            });
            info!(url = %self.stream_url, "SSE transport disconnected");
        }
        Ok(())
    }

    /// Hands the frame to the POST worker; delivery failures arrive as
    /// `TransportEvent::Error`
    async fn send(&mut self, message: &str) -> McpClientResult<()> {
        if self.status() != TransportStatus::Connected {
            return Err(McpClientError::not_connected());
        }
        let Some(outbound) = &self.outbound else {
            return Err(McpClientError::not_connected());
        };
        outbound
            .send(message.to_string())
            .map_err(|_| McpClientError::connection_closed("SSE POST worker has stopped"))
    }

    async fn destroy(&mut self) {
        if self.status() == TransportStatus::Closed {
            return;
        }
        let _ = self.disconnect().await;
        self.shared.set_status(TransportStatus::Closed);
        debug!(url = %self.stream_url, "SSE transport destroyed");
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.stop_stream();
    }
}
