//! Main MCP client implementation
//!
//! [`McpClient`] owns the connection state machine. A single pump task reads
//! [`TransportEvent`]s and feeds inbound frames through the validator; heartbeat
//! and reconnect tasks hold weak references so dropping the last client handle
//! tears everything down.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use tether_mcp_json_rpc::{
    JsonRpcErrorObject, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId,
};
use tether_mcp_protocol::methods;
use tether_mcp_protocol::{
    CallToolParams, CallToolResult, ClientCapabilities, GetPromptParams, GetPromptResult,
    Implementation, InitializeParams, InitializeResult, ListPromptsResult, ListResourcesResult,
    ListToolsResult, McpVersion, MessageValidator, Prompt, ReadResourceParams, ReadResourceResult,
    Resource, Tool, ValidationError,
};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::error::{McpClientError, McpClientResult, codes};
use crate::events::{ClientEvent, EventBus, SubscriptionId};
use crate::heartbeat::{HeartbeatMonitor, Probe};
use crate::pending::PendingTable;
use crate::queue::{OutboundQueue, QueuedFrame};
use crate::state::{ClientStatus, StatusHistory, StatusTransition};
use crate::stats::ClientStatistics;
use crate::transport::websocket::ABNORMAL_CLOSURE;
use crate::transport::{
    BoxedTransport, EventReceiver, TransportEvent, TransportFactory, TransportStatistics,
    TransportStatus, TransportType, detect_transport_type,
};

/// A request as handed to [`McpClient::send`]
#[derive(Debug, Clone)]
pub struct ClientRequest {
    /// Assigned from the client's counter when absent
    pub id: Option<RequestId>,
    pub method: String,
    pub params: Option<Value>,
    /// Overrides `timeouts.request`
    pub timeout: Option<Duration>,
}

impl ClientRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            id: None,
            method: method.into(),
            params: None,
            timeout: None,
        }
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Per-call options for tool and resource invocations
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    /// Send even when the discovery cache does not list the target
    pub skip_local_check: bool,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip_local_check(mut self) -> Self {
        self.skip_local_check = true;
        self
    }
}

/// Where an outbound frame goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Wire,
    Queue,
}

/// Which discovery list a change notification refers to
#[derive(Debug, Clone, Copy)]
enum ListKind {
    Tools,
    Resources,
    Prompts,
}

impl std::fmt::Display for ListKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListKind::Tools => f.write_str("tools"),
            ListKind::Resources => f.write_str("resources"),
            ListKind::Prompts => f.write_str("prompts"),
        }
    }
}

struct ClientState {
    status: ClientStatus,
    history: StatusHistory,
    pending: PendingTable,
    queue: OutboundQueue,
    stats: ClientStatistics,
    server: Option<InitializeResult>,
    // `None` until a list call succeeds
    tools: Option<Vec<Tool>>,
    resources: Option<Vec<Resource>>,
    prompts: Option<Vec<Prompt>>,
    reconnect_attempt: u32,
}

#[derive(Default)]
struct ClientTasks {
    pump: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct ClientInner {
    config: ClientConfig,
    validator: MessageValidator,
    /// Serializes writes so frames reach the wire in call order
    transport: tokio::sync::Mutex<BoxedTransport>,
    transport_type: TransportType,
    endpoint: String,
    state: Mutex<ClientState>,
    events: EventBus,
    heartbeat: HeartbeatMonitor,
    next_id: AtomicU64,
    tasks: Mutex<ClientTasks>,
    transport_events: Mutex<Option<EventReceiver>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for handle in [
            tasks.pump.take(),
            tasks.heartbeat.take(),
            tasks.reconnect.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// Removes a request from the pending table and the queue if its caller
/// stops waiting before an outcome arrives
struct PendingGuard<'a> {
    inner: &'a ClientInner,
    id: Option<RequestId>,
}

impl PendingGuard<'_> {
    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let mut state = self.inner.state.lock();
            if state.pending.take(&id).is_some() {
                state.queue.remove(&id);
                trace!(id = %id, "Request abandoned by caller");
            }
        }
    }
}

/// Main MCP client
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("transport_type", &self.inner.transport_type)
            .field("endpoint", &self.inner.endpoint)
            .field("status", &self.status())
            .finish()
    }
}

impl McpClient {
    /// Create a new client over `transport`
    pub fn new(mut transport: BoxedTransport, config: ClientConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        transport.set_event_sender(sender);

        let info = transport.connection_info();
        let validator = MessageValidator::new(config.limits.validation.clone());
        let heartbeat = HeartbeatMonitor::new(config.heartbeat.clone());
        let queue = OutboundQueue::new(config.limits.max_queue_size);

        let inner = ClientInner {
            validator,
            transport_type: info.transport_type,
            endpoint: info.endpoint,
            transport: tokio::sync::Mutex::new(transport),
            state: Mutex::new(ClientState {
                status: ClientStatus::Idle,
                history: StatusHistory::default(),
                pending: PendingTable::default(),
                queue,
                stats: ClientStatistics::default(),
                server: None,
                tools: None,
                resources: None,
                prompts: None,
                reconnect_attempt: 0,
            }),
            events: EventBus::default(),
            heartbeat,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(ClientTasks::default()),
            transport_events: Mutex::new(Some(receiver)),
            config,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Connect, run the initialize handshake and discovery
    pub async fn connect(&self) -> McpClientResult<()> {
        let inner = &self.inner;

        match inner.status() {
            ClientStatus::Connected => {
                debug!("Already connected");
                return Ok(());
            }
            ClientStatus::Closed => {
                return Err(McpClientError::invalid_state("client has been destroyed"));
            }
            status @ (ClientStatus::Connecting
            | ClientStatus::Reconnecting
            | ClientStatus::Disconnecting) => {
                return Err(McpClientError::invalid_state(format!(
                    "cannot connect while {}",
                    status
                )));
            }
            ClientStatus::Idle | ClientStatus::Disconnected | ClientStatus::Error => {}
        }

        inner.ensure_pump();
        if !inner.transition_from(
            &[
                ClientStatus::Idle,
                ClientStatus::Disconnected,
                ClientStatus::Error,
            ],
            ClientStatus::Connecting,
        ) {
            return Err(McpClientError::invalid_state(
                "connection state changed during connect",
            ));
        }

        info!(
            transport = %inner.transport_type,
            endpoint = %inner.endpoint,
            "Connecting to MCP server"
        );

        let result = match inner.establish().await {
            Ok(server) => inner.finish_connect(server).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(error = %e, "Failed to connect to MCP server");
            inner.close_transport().await;
            if inner.transition_from(&[ClientStatus::Connecting], ClientStatus::Error) {
                inner.state.lock().stats.errors += 1;
                inner.reject_all(e);
            }
        }

        result
    }

    /// Close the connection; pending and queued requests fail with `CONNECTION_CLOSING`
    pub async fn disconnect(&self) -> McpClientResult<()> {
        let inner = &self.inner;
        let previous = inner.status();

        match previous {
            ClientStatus::Closed => {
                return Err(McpClientError::invalid_state("client has been destroyed"));
            }
            ClientStatus::Idle | ClientStatus::Disconnected | ClientStatus::Disconnecting => {
                debug!(status = %previous, "Nothing to disconnect");
                return Ok(());
            }
            _ => {}
        }

        info!("Disconnecting from MCP server");
        inner.transition(ClientStatus::Disconnecting)?;
        inner.stop_background();
        inner.reject_all(&McpClientError::connection_closing());
        inner.close_transport().await;

        if inner.transition_from(&[ClientStatus::Disconnecting], ClientStatus::Disconnected)
            && previous == ClientStatus::Connected
        {
            inner.events.emit(ClientEvent::Disconnected {
                code: Some(1000),
                reason: "client disconnect".to_string(),
            });
        }

        info!("Disconnected from MCP server");
        Ok(())
    }

    /// Tear down for good: the transport is destroyed and every subscription ends
    pub async fn destroy(&self) {
        let inner = &self.inner;
        let Ok(previous) = inner.transition(ClientStatus::Closed) else {
            debug!("Client already destroyed");
            return;
        };

        info!("Destroying MCP client");
        inner.stop_background();
        inner.reject_all(&McpClientError::connection_closing());
        inner.transport.lock().await.destroy().await;

        if previous == ClientStatus::Connected {
            inner.events.emit(ClientEvent::Disconnected {
                code: Some(1000),
                reason: "client destroyed".to_string(),
            });
        }
        inner.events.close();

        if let Some(pump) = inner.tasks.lock().pump.take() {
            pump.abort();
        }
    }

    /// Send a request and wait for its result
    pub async fn send(&self, request: ClientRequest) -> McpClientResult<Value> {
        self.inner
            .request_with(
                request.id,
                &request.method,
                request.params,
                request.timeout,
                false,
            )
            .await
    }

    /// Shorthand for [`McpClient::send`] with an assigned id and the default timeout
    pub async fn request(&self, method: &str, params: Option<Value>) -> McpClientResult<Value> {
        self.inner
            .request_with(None, method, params, None, false)
            .await
    }

    /// Send a notification; no response is expected
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpClientResult<()> {
        self.inner.notify_with(method, params, false).await
    }

    /// Call a tool
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        options: RequestOptions,
    ) -> McpClientResult<CallToolResult> {
        debug!(tool = name, "Calling tool");
        self.inner.validator.validate_tool_name(name)?;

        if !options.skip_local_check {
            let known = self
                .inner
                .state
                .lock()
                .tools
                .as_ref()
                .map(|tools| tools.iter().any(|tool| tool.name == name));
            if known == Some(false) {
                return Err(McpClientError::tool_not_found(name));
            }
        }

        let mut params = CallToolParams::new(name);
        if !arguments.is_null() {
            params = params.with_arguments(arguments);
        }

        let result = self
            .inner
            .request_with(
                None,
                methods::TOOLS_CALL,
                Some(to_params(&params)?),
                options.timeout,
                false,
            )
            .await
            .map_err(|e| match e.server_error_object() {
                Some(object) => McpClientError::tool_failed(&object),
                None => e,
            })?;

        let result: CallToolResult = parse_result(methods::TOOLS_CALL, result)?;
        debug!(tool = name, is_error = result.is_error(), "Tool call completed");
        Ok(result)
    }

    /// Read a resource
    pub async fn get_resource(
        &self,
        uri: &str,
        options: RequestOptions,
    ) -> McpClientResult<ReadResourceResult> {
        debug!(uri = uri, "Reading resource");
        self.inner.validator.validate_uri(uri)?;

        if !options.skip_local_check {
            let known = self
                .inner
                .state
                .lock()
                .resources
                .as_ref()
                .map(|resources| resources.iter().any(|resource| resource.uri == uri));
            if known == Some(false) {
                return Err(McpClientError::resource_not_found(uri));
            }
        }

        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        let result = self
            .inner
            .request_with(
                None,
                methods::RESOURCES_READ,
                Some(to_params(&params)?),
                options.timeout,
                false,
            )
            .await
            .map_err(|e| match e.server_error_object() {
                Some(object) => McpClientError::resource_failed(&object),
                None => e,
            })?;

        let result: ReadResourceResult = parse_result(methods::RESOURCES_READ, result)?;
        debug!(uri = uri, count = result.contents.len(), "Resource read");
        Ok(result)
    }

    /// Fetch every page of `tools/list` and refresh the cache
    pub async fn list_tools(&self) -> McpClientResult<Vec<Tool>> {
        self.inner.list_tools().await
    }

    /// Fetch every page of `resources/list` and refresh the cache
    pub async fn list_resources(&self) -> McpClientResult<Vec<Resource>> {
        self.inner.list_resources().await
    }

    /// Fetch every page of `prompts/list` and refresh the cache
    pub async fn list_prompts(&self) -> McpClientResult<Vec<Prompt>> {
        self.inner.list_prompts().await
    }

    /// Render a prompt
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> McpClientResult<GetPromptResult> {
        debug!(prompt = name, "Getting prompt");
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        let result = self
            .inner
            .request_with(
                None,
                methods::PROMPTS_GET,
                Some(to_params(&params)?),
                None,
                false,
            )
            .await?;
        parse_result(methods::PROMPTS_GET, result)
    }

    /// Round-trip an MCP `ping`
    pub async fn ping(&self) -> McpClientResult<()> {
        self.inner
            .request_with(None, methods::PING, None, None, false)
            .await?;
        debug!("Ping successful");
        Ok(())
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.status()
    }

    /// Check if the client is ready for requests
    pub fn is_ready(&self) -> bool {
        self.status() == ClientStatus::Connected
    }

    /// Result of the last successful handshake
    pub fn server(&self) -> Option<InitializeResult> {
        self.inner.state.lock().server.clone()
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.inner.state.lock().tools.clone().unwrap_or_default()
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.inner.state.lock().resources.clone().unwrap_or_default()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.inner.state.lock().prompts.clone().unwrap_or_default()
    }

    pub fn stats(&self) -> ClientStatistics {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.queued_messages = state.queue.len() as u64;
        stats
    }

    pub fn status_history(&self) -> Vec<StatusTransition> {
        self.inner.state.lock().history.entries()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn queued_messages(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Get connection status
    pub async fn connection_status(&self) -> ConnectionStatus {
        let transport_status = self.inner.transport.lock().await.status();
        let state = self.inner.state.lock();

        ConnectionStatus {
            status: state.status,
            transport_status,
            transport_type: self.inner.transport_type,
            endpoint: self.inner.endpoint.clone(),
            server: state.server.as_ref().map(|server| server.server_info.clone()),
            protocol_version: state
                .server
                .as_ref()
                .map(|server| server.protocol_version.clone()),
            pending_requests: state.pending.len(),
            queued_messages: state.queue.len(),
            reconnect_attempt: state.reconnect_attempt,
        }
    }

    /// Get transport statistics
    pub async fn transport_stats(&self) -> TransportStatistics {
        self.inner.transport.lock().await.statistics()
    }

    /// Broadcast receiver for client events; drop it to unsubscribe
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn on_event<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_event(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }
}

impl ClientInner {
    fn status(&self) -> ClientStatus {
        self.state.lock().status
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst) as i64)
    }

    /// Validated transition from whatever the current status is
    fn transition(&self, next: ClientStatus) -> McpClientResult<ClientStatus> {
        let old = {
            let mut state = self.state.lock();
            let old = state.status;
            if !old.can_transition_to(next) {
                return Err(McpClientError::invalid_state(format!(
                    "invalid status transition {} -> {}",
                    old, next
                )));
            }
            state.status = next;
            state.history.record(old, next, Utc::now());
            old
        };
        self.announce(old, next);
        Ok(old)
    }

    /// Transition only if the current status is one of `expected`
    fn transition_from(&self, expected: &[ClientStatus], next: ClientStatus) -> bool {
        let old = {
            let mut state = self.state.lock();
            let old = state.status;
            if !expected.contains(&old) || !old.can_transition_to(next) {
                return false;
            }
            state.status = next;
            state.history.record(old, next, Utc::now());
            old
        };
        self.announce(old, next);
        true
    }

    fn announce(&self, old: ClientStatus, new: ClientStatus) {
        info!(from = %old, to = %new, "Client status changed");
        self.events.emit(ClientEvent::StatusChange {
            old,
            new,
            timestamp: Utc::now(),
        });
    }

    fn route(&self, status: ClientStatus, handshake: bool) -> McpClientResult<Route> {
        match status {
            ClientStatus::Connected => Ok(Route::Wire),
            ClientStatus::Connecting if handshake => Ok(Route::Wire),
            status if status.accepts_queueing() && self.config.reconnect.auto_reconnect => {
                Ok(Route::Queue)
            }
            ClientStatus::Closed => Err(McpClientError::invalid_state("client has been destroyed")),
            ClientStatus::Disconnecting => Err(McpClientError::connection_closing()),
            _ => Err(McpClientError::not_connected()),
        }
    }

    /// Register, send (or queue) and await one request
    ///
    /// `handshake` lets the initialize exchange through while still `Connecting`.
    async fn request_with(
        &self,
        id: Option<RequestId>,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
        handshake: bool,
    ) -> McpClientResult<Value> {
        let id = id.unwrap_or_else(|| self.next_request_id());
        let message = JsonRpcMessage::Request(JsonRpcRequest::new(id.clone(), method, params));
        let text = self.validator.serialize_outbound(&message)?;

        let timeout = timeout.unwrap_or(self.config.timeouts.request);
        let created_at = Instant::now();
        let deadline = created_at + timeout;

        let (route, receiver) = {
            let mut state = self.state.lock();
            let route = self.route(state.status, handshake)?;
            let Some(receiver) = state.pending.insert(id.clone(), method, created_at, deadline)
            else {
                return Err(McpClientError::validation(&ValidationError::new(
                    "id",
                    format!("request id {} is already pending", id),
                )));
            };

            if route == Route::Queue {
                let frame = QueuedFrame {
                    id: Some(id.clone()),
                    method: method.to_string(),
                    text: text.clone(),
                };
                if let Err(e) = state.queue.push(frame) {
                    state.pending.take(&id);
                    return Err(e);
                }
                debug!(id = %id, method = method, queued = state.queue.len(), "Request queued until connected");
            }
            (route, receiver)
        };

        let guard = PendingGuard {
            inner: self,
            id: Some(id.clone()),
        };

        if route == Route::Wire {
            let written = tokio::time::timeout_at(deadline, self.write_frame(&text, method)).await;
            let failure = match written {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => {
                    self.state.lock().stats.timeouts += 1;
                    warn!(id = %id, method = method, timeout_ms = timeout.as_millis() as u64, "Request timed out while sending");
                    Some(McpClientError::request_timeout(method, timeout))
                }
            };
            if let Some(e) = failure {
                self.state.lock().pending.take(&id);
                guard.disarm();
                return Err(e);
            }
        }

        debug!(id = %id, method = method, "Request sent");
        let outcome = self
            .await_outcome(&id, method, receiver, deadline, timeout)
            .await;
        guard.disarm();
        outcome
    }

    async fn await_outcome(
        &self,
        id: &RequestId,
        method: &str,
        mut receiver: oneshot::Receiver<McpClientResult<Value>>,
        deadline: Instant,
        timeout: Duration,
    ) -> McpClientResult<Value> {
        tokio::select! {
            outcome = &mut receiver => return flatten(outcome),
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let expired = {
            let mut state = self.state.lock();
            let expired = state.pending.take(id);
            if expired.is_some() {
                state.queue.remove(id);
                state.stats.timeouts += 1;
            }
            expired
        };

        match expired {
            Some(_) => {
                warn!(id = %id, method = method, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(McpClientError::request_timeout(method, timeout))
            }
            // Completed concurrently with the deadline
            None => flatten(receiver.await),
        }
    }

    async fn notify_with(
        &self,
        method: &str,
        params: Option<Value>,
        handshake: bool,
    ) -> McpClientResult<()> {
        let message = JsonRpcMessage::Notification(JsonRpcNotification::new(method, params));
        let text = self.validator.serialize_outbound(&message)?;

        let route = {
            let mut state = self.state.lock();
            let route = self.route(state.status, handshake)?;
            if route == Route::Queue {
                state.queue.push(QueuedFrame {
                    id: None,
                    method: method.to_string(),
                    text: text.clone(),
                })?;
            }
            route
        };

        if route == Route::Wire {
            self.write_frame(&text, method).await?;
        }
        Ok(())
    }

    async fn write_frame(&self, text: &str, method: &str) -> McpClientResult<()> {
        let mut transport = self.transport.lock().await;
        self.write_locked(&mut transport, text, method).await
    }

    async fn write_locked(
        &self,
        transport: &mut BoxedTransport,
        text: &str,
        method: &str,
    ) -> McpClientResult<()> {
        if self.config.logging.log_messages {
            trace!(method = method, frame = text, "Sending frame");
        }
        if let Err(e) = transport.send(text).await {
            self.state.lock().stats.errors += 1;
            return Err(e);
        }
        self.state.lock().stats.record_sent(text.len());
        Ok(())
    }

    /// Fail every pending and queued request with `error`
    fn reject_all(&self, error: &McpClientError) {
        let (pending, dropped) = {
            let mut state = self.state.lock();
            if state.pending.is_empty() && state.queue.is_empty() {
                return;
            }
            (state.pending.drain(), state.queue.drain())
        };

        let now = Instant::now();
        debug!(
            pending = pending.len(),
            queued = dropped.len(),
            code = error.code,
            "Rejecting outstanding requests"
        );
        for (id, entry) in pending {
            trace!(
                id = %id,
                method = %entry.method,
                remaining_ms = entry.deadline.saturating_duration_since(now).as_millis() as u64,
                "Rejecting request"
            );
            entry.fail(error.clone());
        }
    }

    async fn close_transport(&self) {
        if let Err(e) = self.transport.lock().await.disconnect().await {
            debug!(error = %e, "Transport disconnect failed");
        }
    }

    fn ensure_pump(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if tasks.pump.is_some() {
            return;
        }
        let Some(mut receiver) = self.transport_events.lock().take() else {
            return;
        };

        let weak = Arc::downgrade(self);
        tasks.pump = Some(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_transport_event(event);
            }
            trace!("Transport event pump stopped");
        }));
    }

    fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Message(raw) => self.handle_inbound(raw),
            TransportEvent::Heartbeat => {
                trace!("Transport heartbeat");
                self.heartbeat.touch();
            }
            TransportEvent::Disconnected { code, reason } => {
                if self.status() == ClientStatus::Connected {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move { inner.connection_lost(code, reason, false).await });
                } else {
                    debug!(?code, reason = %reason, "Transport disconnected");
                }
            }
            TransportEvent::Error { error, context } => {
                warn!(error = %error, context = %context, "Transport error");
                self.state.lock().stats.errors += 1;
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                info!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Transport resuming stream"
                );
            }
            TransportEvent::Connected => trace!("Transport connected"),
            TransportEvent::StatusChange { old, new } => {
                trace!(from = %old, to = %new, "Transport status changed");
            }
        }
    }

    fn handle_inbound(self: &Arc<Self>, raw: String) {
        self.heartbeat.touch();
        self.state.lock().stats.record_received(raw.len());
        if self.config.logging.log_messages {
            trace!(frame = %raw, "Received frame");
        }

        let message = match self.validator.parse(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(path = %e.path, reason = %e.reason, "Dropping invalid inbound message");
                self.state.lock().stats.errors += 1;
                self.events
                    .emit(ClientEvent::Error(McpClientError::invalid_message(&e)));
                return;
            }
        };

        match message {
            JsonRpcMessage::Response(response) => self.handle_response(response),
            JsonRpcMessage::Notification(notification) => self.handle_notification(notification),
            JsonRpcMessage::Request(request) => self.handle_server_request(request),
        }
    }

    fn handle_response(&self, response: JsonRpcResponse) {
        let entry = {
            let mut state = self.state.lock();
            let entry = state.pending.take(&response.id);
            if let Some(entry) = &entry {
                state.stats.record_latency(entry.created_at.elapsed());
            }
            entry
        };

        let Some(entry) = entry else {
            debug!(id = %response.id, "Dropping response for unknown request id");
            return;
        };

        debug!(id = %response.id, method = %entry.method, "Response received");
        let outcome = response
            .payload
            .into_result()
            .map_err(|e| McpClientError::server(&e));
        if !entry.complete(outcome) {
            trace!(id = %response.id, "Caller no longer waiting");
        }
    }

    fn handle_notification(self: &Arc<Self>, notification: JsonRpcNotification) {
        debug!(method = %notification.method, "Notification received");
        match notification.method.as_str() {
            methods::NOTIFICATION_TOOLS_LIST_CHANGED => self.spawn_refresh(ListKind::Tools),
            methods::NOTIFICATION_RESOURCES_LIST_CHANGED => {
                self.spawn_refresh(ListKind::Resources)
            }
            methods::NOTIFICATION_PROMPTS_LIST_CHANGED => self.spawn_refresh(ListKind::Prompts),
            _ => self.events.emit(ClientEvent::Message(message_value(
                &JsonRpcMessage::Notification(notification),
            ))),
        }
    }

    fn handle_server_request(self: &Arc<Self>, request: JsonRpcRequest) {
        let reply = if request.method == methods::PING {
            JsonRpcResponse::success(request.id.clone(), json!({}))
        } else {
            debug!(method = %request.method, id = %request.id, "Unsupported server request");
            let reply = JsonRpcResponse::error(
                request.id.clone(),
                JsonRpcErrorObject::method_not_found(&request.method),
            );
            self.events.emit(ClientEvent::Message(message_value(
                &JsonRpcMessage::Request(request),
            )));
            reply
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.reply(reply).await });
    }

    async fn reply(&self, response: JsonRpcResponse) {
        let text = match self
            .validator
            .serialize_outbound(&JsonRpcMessage::Response(response))
        {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Cannot serialize reply");
                return;
            }
        };
        if let Err(e) = self.write_frame(&text, "response").await {
            warn!(error = %e, "Failed to reply to server request");
        }
    }

    fn spawn_refresh(self: &Arc<Self>, kind: ListKind) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = match kind {
                ListKind::Tools => inner.list_tools().await.map(|tools| {
                    inner.events.emit(ClientEvent::ToolsUpdated(tools));
                }),
                ListKind::Resources => inner.list_resources().await.map(|resources| {
                    inner.events.emit(ClientEvent::ResourcesUpdated(resources));
                }),
                ListKind::Prompts => inner.list_prompts().await.map(|prompts| {
                    inner.events.emit(ClientEvent::PromptsUpdated(prompts));
                }),
            };
            if let Err(e) = result {
                warn!(list = %kind, error = %e, "Failed to refresh list after change notification");
            }
        });
    }

    /// Connect the transport and run the initialize exchange
    async fn establish(&self) -> McpClientResult<InitializeResult> {
        let connect_timeout = self.config.timeouts.connect;
        {
            let mut transport = self.transport.lock().await;
            match tokio::time::timeout(connect_timeout, transport.connect()).await {
                Ok(result) => result?,
                Err(_) => return Err(McpClientError::connection_timeout(connect_timeout)),
            }
        }
        self.heartbeat.touch();

        let params = InitializeParams::new(
            McpVersion::CURRENT,
            ClientCapabilities::default(),
            self.config.client_info.clone(),
        );
        let result = self
            .request_with(
                None,
                methods::INITIALIZE,
                Some(to_params(&params)?),
                Some(self.config.timeouts.initialization),
                true,
            )
            .await
            .map_err(|e| {
                if e.server_code.is_some() {
                    McpClientError::handshake_failed(format!("server rejected initialize: {}", e.message))
                        .with_cause(&e)
                } else {
                    e
                }
            })?;

        let server: InitializeResult = parse_result(methods::INITIALIZE, result)?;
        let version = server.protocol_version()?;
        debug!(
            server = %server.server_info.name,
            protocol_version = %version,
            "Initialize handshake completed"
        );

        self.notify_with(methods::NOTIFICATION_INITIALIZED, None, true)
            .await?;
        Ok(server)
    }

    /// Mark the connection live, flush the queue, start the heartbeat and run discovery
    async fn finish_connect(self: &Arc<Self>, server: InitializeResult) -> McpClientResult<()> {
        {
            // Held across the flush so new sends land behind queued frames
            let mut transport = self.transport.lock().await;
            if !self.transition_from(&[ClientStatus::Connecting], ClientStatus::Connected) {
                return Err(McpClientError::connection_closing());
            }
            {
                let mut state = self.state.lock();
                state.server = Some(server.clone());
                state.stats.connected_since = Some(Utc::now());
                state.reconnect_attempt = 0;
            }
            self.flush_queue(&mut transport).await;
        }

        self.heartbeat.touch();
        self.start_heartbeat();
        self.discover().await;

        info!(
            server = %server.server_info.name,
            version = %server.server_info.version,
            "Connected to MCP server"
        );
        self.events.emit(ClientEvent::Connected {
            server: Box::new(server),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn flush_queue(&self, transport: &mut BoxedTransport) {
        let mut flushed = 0usize;
        loop {
            let next = self.state.lock().queue.pop();
            let Some(frame) = next else {
                break;
            };
            if let Err(e) = self.write_locked(transport, &frame.text, &frame.method).await {
                warn!(method = %frame.method, error = %e, "Failed to flush queued frame");
                self.state.lock().queue.push_front(frame);
                break;
            }
            flushed += 1;
        }
        if flushed > 0 {
            debug!(flushed = flushed, "Flushed outbound queue");
        }
    }

    /// Populate the discovery caches; failures leave them untouched
    async fn discover(&self) {
        if let Err(e) = self.list_tools().await {
            warn!(error = %e, "Tool discovery failed");
        }
        if let Err(e) = self.list_resources().await {
            warn!(error = %e, "Resource discovery failed");
        }
        if let Err(e) = self.list_prompts().await {
            warn!(error = %e, "Prompt discovery failed");
        }
    }

    async fn list_tools(&self) -> McpClientResult<Vec<Tool>> {
        let tools = self
            .paginate(methods::TOOLS_LIST, |page: ListToolsResult| {
                (page.tools, page.next_cursor)
            })
            .await?;
        self.validator.validate_tools(&tools)?;

        debug!(count = tools.len(), "Retrieved tools");
        self.state.lock().tools = Some(tools.clone());
        Ok(tools)
    }

    async fn list_resources(&self) -> McpClientResult<Vec<Resource>> {
        let resources = self
            .paginate(methods::RESOURCES_LIST, |page: ListResourcesResult| {
                (page.resources, page.next_cursor)
            })
            .await?;
        self.validator.validate_resources(&resources)?;

        debug!(count = resources.len(), "Retrieved resources");
        self.state.lock().resources = Some(resources.clone());
        Ok(resources)
    }

    async fn list_prompts(&self) -> McpClientResult<Vec<Prompt>> {
        let prompts = self
            .paginate(methods::PROMPTS_LIST, |page: ListPromptsResult| {
                (page.prompts, page.next_cursor)
            })
            .await?;

        debug!(count = prompts.len(), "Retrieved prompts");
        self.state.lock().prompts = Some(prompts.clone());
        Ok(prompts)
    }

    /// Follow `nextCursor` until the server stops returning one
    async fn paginate<P, T>(
        &self,
        method: &str,
        split: impl Fn(P) -> (Vec<T>, Option<String>),
    ) -> McpClientResult<Vec<T>>
    where
        P: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|cursor| json!({ "cursor": cursor }));
            let result = self
                .request_with(None, method, params, None, false)
                .await?;
            let (page, next) = split(parse_result(method, result)?);
            items.extend(page);

            let Some(next) = next.filter(|next| !next.is_empty()) else {
                break;
            };
            if !seen.insert(next.clone()) {
                warn!(method = method, cursor = %next, "Server repeated a pagination cursor");
                break;
            }
            cursor = Some(next);
        }

        Ok(items)
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let Some(period) = self.heartbeat.interval() else {
            return;
        };

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(heartbeat_loop(weak, period));
        if let Some(previous) = self.tasks.lock().heartbeat.replace(handle) {
            previous.abort();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.tasks.lock().heartbeat.take() {
            handle.abort();
        }
    }

    fn stop_background(&self) {
        let mut tasks = self.tasks.lock();
        for handle in [tasks.heartbeat.take(), tasks.reconnect.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }

    /// React to a connection that went away while `Connected`
    async fn connection_lost(
        self: Arc<Self>,
        code: Option<u16>,
        reason: String,
        close_transport: bool,
    ) {
        let auto_reconnect = self.config.reconnect.auto_reconnect;
        let next = if auto_reconnect {
            ClientStatus::Reconnecting
        } else {
            ClientStatus::Disconnected
        };
        if !self.transition_from(&[ClientStatus::Connected], next) {
            return;
        }

        warn!(?code, reason = %reason, "Connection to MCP server lost");
        self.stop_heartbeat();
        if close_transport {
            self.close_transport().await;
        }

        self.events.emit(ClientEvent::Disconnected {
            code,
            reason: reason.clone(),
        });

        if auto_reconnect {
            self.spawn_reconnect();
        } else {
            self.reject_all(&McpClientError::connection_closed(reason));
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let backoff = Backoff::new(self.config.reconnect.clone());
        let handle = tokio::spawn(reconnect_loop(weak, backoff));
        if let Some(previous) = self.tasks.lock().reconnect.replace(handle) {
            previous.abort();
        }
    }
}

async fn heartbeat_loop(weak: Weak<ClientInner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if inner.status() != ClientStatus::Connected {
            break;
        }

        if inner.heartbeat.is_expired() {
            let silence = inner.heartbeat.silence();
            warn!(silence_ms = silence.as_millis() as u64, "Heartbeat liveness timeout");
            inner.events.emit(ClientEvent::Error(McpClientError::transport(
                codes::HEARTBEAT_TIMEOUT,
                format!("no traffic from server for {}ms", silence.as_millis()),
            )));
            // Runs outside this task, which connection_lost aborts
            tokio::spawn(inner.connection_lost(
                Some(ABNORMAL_CLOSURE),
                "heartbeat timeout".to_string(),
                true,
            ));
            break;
        }

        match inner.heartbeat.probe() {
            Some(Probe::Notification) => {
                if let Err(e) = inner
                    .notify_with(methods::NOTIFICATION_HEARTBEAT, None, false)
                    .await
                {
                    debug!(error = %e, "Heartbeat notification failed");
                }
            }
            Some(Probe::PingRequest) => {
                tokio::spawn(async move {
                    if let Err(e) = inner
                        .request_with(None, methods::PING, None, None, false)
                        .await
                    {
                        debug!(error = %e, "Heartbeat ping failed");
                    }
                });
            }
            None => break,
        }
    }
}

async fn reconnect_loop(weak: Weak<ClientInner>, mut backoff: Backoff) {
    while let Some((attempt, delay)) = backoff.next_attempt() {
        {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.status() != ClientStatus::Reconnecting {
                return;
            }
            info!(
                attempt = attempt,
                max_attempts = backoff.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnection attempt"
            );
            inner.state.lock().reconnect_attempt = attempt;
            inner.events.emit(ClientEvent::Reconnecting {
                attempt,
                max_attempts: backoff.max_attempts(),
                delay,
            });
        }

        tokio::time::sleep(delay).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.transition_from(&[ClientStatus::Reconnecting], ClientStatus::Connecting) {
            return;
        }

        let result = match inner.establish().await {
            Ok(server) => inner.finish_connect(server).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                inner.state.lock().stats.reconnections += 1;
                info!(attempt = attempt, "Reconnected to MCP server");
                return;
            }
            Err(e) => {
                warn!(attempt = attempt, error = %e, "Reconnection attempt failed");
                inner.close_transport().await;
                if !inner.transition_from(&[ClientStatus::Connecting], ClientStatus::Reconnecting) {
                    return;
                }
            }
        }
    }

    let Some(inner) = weak.upgrade() else {
        return;
    };
    if !inner.transition_from(&[ClientStatus::Reconnecting], ClientStatus::Error) {
        return;
    }

    let error = McpClientError::reconnect_exhausted(backoff.attempts());
    error!(attempts = backoff.attempts(), "Reconnection attempts exhausted");
    inner.state.lock().stats.errors += 1;
    inner.reject_all(&error);
    inner.events.emit(ClientEvent::Error(error));
}

fn flatten(
    outcome: Result<McpClientResult<Value>, oneshot::error::RecvError>,
) -> McpClientResult<Value> {
    outcome.unwrap_or_else(|_| Err(McpClientError::connection_closed("request abandoned")))
}

fn to_params<T: Serialize>(params: &T) -> McpClientResult<Value> {
    serde_json::to_value(params).map_err(|e| {
        McpClientError::validation(&ValidationError::new("params", e.to_string()))
    })
}

fn parse_result<T: DeserializeOwned>(method: &str, result: Value) -> McpClientResult<T> {
    serde_json::from_value(result).map_err(|e| McpClientError::unexpected_response(method, e))
}

fn message_value(message: &JsonRpcMessage) -> Value {
    serde_json::to_value(message).unwrap_or(Value::Null)
}

/// Connection status information
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub status: ClientStatus,
    pub transport_status: TransportStatus,
    pub transport_type: TransportType,
    pub endpoint: String,
    pub server: Option<Implementation>,
    pub protocol_version: Option<String>,
    pub pending_requests: usize,
    pub queued_messages: usize,
    pub reconnect_attempt: u32,
}

impl ConnectionStatus {
    /// Check if fully connected and ready
    pub fn is_ready(&self) -> bool {
        self.status == ClientStatus::Connected && self.transport_status == TransportStatus::Connected
    }

    /// Get status summary
    pub fn summary(&self) -> String {
        let server = match &self.server {
            Some(server) => format!("{} {}", server.name, server.version),
            None => "no server".to_string(),
        };
        let mut summary = format!(
            "{} transport to {} - {} ({}, {} pending, {} queued)",
            self.transport_type,
            self.endpoint,
            self.status,
            server,
            self.pending_requests,
            self.queued_messages
        );
        if self.status == ClientStatus::Reconnecting {
            summary.push_str(&format!(" [attempt {}]", self.reconnect_attempt));
        }
        summary
    }
}

/// Builder for creating MCP clients
pub struct McpClientBuilder {
    transport: Option<BoxedTransport>,
    url: Option<String>,
    config: Option<ClientConfig>,
}

impl McpClientBuilder {
    /// Create a new client builder
    pub fn new() -> Self {
        Self {
            transport: None,
            url: None,
            config: None,
        }
    }

    /// Set transport
    pub fn with_transport(mut self, transport: BoxedTransport) -> Self {
        self.transport = Some(transport);
        self.url = None;
        self
    }

    /// Set transport from URL; built with the final config's headers
    pub fn with_url(mut self, url: &str) -> McpClientResult<Self> {
        detect_transport_type(url)?;
        self.url = Some(url.to_string());
        self.transport = None;
        Ok(self)
    }

    /// Set configuration
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the client
    pub fn build(self) -> McpClientResult<McpClient> {
        let config = self.config.unwrap_or_default();
        let transport = match (self.transport, self.url) {
            (Some(transport), _) => transport,
            (None, Some(url)) => TransportFactory::from_url_with_config(&url, &config)?,
            (None, None) => {
                return Err(McpClientError::invalid_state(
                    "transport must be set before building client",
                ));
            }
        };

        Ok(McpClient::new(transport, config))
    }
}

impl Default for McpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
