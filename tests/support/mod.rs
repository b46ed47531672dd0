//! Shared helpers for the integration tests
//!
//! [`MockServer`] plays an MCP server on the far side of a Local transport:
//! it answers the handshake, discovery, tool calls and `echo`, and hands any
//! request whose method was put on hold to the test instead.

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use tether_mcp_client::transport::{LocalPeer, LocalTransport};
use tether_mcp_client::{
    ClientConfig, ClientEvent, HeartbeatConfig, HeartbeatMode, McpClient, ReconnectConfig,
};
use tether_mcp_protocol::McpVersion;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// No heartbeat task, no automatic reconnection
pub fn test_config() -> ClientConfig {
    ClientConfig {
        heartbeat: HeartbeatConfig {
            mode: HeartbeatMode::Disabled,
            ..HeartbeatConfig::default()
        },
        reconnect: ReconnectConfig {
            auto_reconnect: false,
            jitter: 0.0,
            ..ReconnectConfig::default()
        },
        ..ClientConfig::default()
    }
}

/// Deterministic backoff: `initial`, doubling, for `max_attempts`
pub fn reconnecting_config(initial: Duration, max_attempts: u32) -> ClientConfig {
    let mut config = test_config();
    config.reconnect = ReconnectConfig {
        auto_reconnect: true,
        max_attempts,
        initial_delay: initial,
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
        jitter: 0.0,
    };
    config
}

/// Server-side catalog and bookkeeping
pub struct Catalog {
    pub tools: Vec<String>,
    pub resources: Vec<String>,
    pub prompts: Vec<String>,
    pub page_size: Option<usize>,
    pub protocol_version: String,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            tools: vec!["echo".to_string()],
            resources: vec!["file:///notes.txt".to_string()],
            prompts: vec!["greeting".to_string()],
            page_size: None,
            protocol_version: McpVersion::CURRENT.as_str().to_string(),
        }
    }
}

impl Catalog {
    /// The response to a client request, as a full JSON-RPC frame
    pub fn respond(&self, request: &Value) -> Value {
        let id = request["id"].clone();
        let params = &request["params"];

        let outcome = match request["method"].as_str().unwrap_or_default() {
            "initialize" => Ok(json!({
                "protocolVersion": self.protocol_version,
                "capabilities": {"tools": {"listChanged": true}, "resources": {}, "prompts": {}},
                "serverInfo": {"name": "mock-server", "version": "1.0.0"}
            })),
            "tools/list" => {
                let (page, next) = self.page(&self.tools, params);
                let tools: Vec<Value> = page
                    .iter()
                    .map(|name| {
                        json!({
                            "name": name,
                            "description": format!("The {} tool", name),
                            "inputSchema": {"type": "object"}
                        })
                    })
                    .collect();
                Ok(with_cursor(json!({ "tools": tools }), next))
            }
            "resources/list" => {
                let (page, next) = self.page(&self.resources, params);
                let resources: Vec<Value> = page
                    .iter()
                    .map(|uri| json!({"uri": uri, "name": uri.rsplit('/').next().unwrap_or(uri)}))
                    .collect();
                Ok(with_cursor(json!({ "resources": resources }), next))
            }
            "prompts/list" => {
                let (page, next) = self.page(&self.prompts, params);
                let prompts: Vec<Value> = page.iter().map(|name| json!({"name": name})).collect();
                Ok(with_cursor(json!({ "prompts": prompts }), next))
            }
            "prompts/get" => Ok(json!({
                "messages": [{
                    "role": "user",
                    "content": {"type": "text", "text": format!("Hello from {}", params["name"].as_str().unwrap_or_default())}
                }]
            })),
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default();
                if self.tools.iter().any(|tool| tool == name) {
                    Ok(json!({
                        "content": [{"type": "text", "text": params["arguments"].to_string()}],
                        "isError": false
                    }))
                } else {
                    Err(json!({"code": -32602, "message": format!("Unknown tool: {}", name)}))
                }
            }
            "resources/read" => {
                let uri = params["uri"].as_str().unwrap_or_default();
                if self.resources.iter().any(|known| known == uri) {
                    Ok(json!({"contents": [{"uri": uri, "text": format!("contents of {}", uri)}]}))
                } else {
                    Err(json!({"code": -32002, "message": format!("Resource not found: {}", uri)}))
                }
            }
            "ping" => Ok(json!({})),
            "echo" => Ok(params.clone()),
            other => Err(json!({"code": -32601, "message": format!("Method not found: {}", other)})),
        };

        match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
        }
    }

    fn page<'a>(&self, items: &'a [String], params: &Value) -> (&'a [String], Option<String>) {
        let start = params["cursor"]
            .as_str()
            .and_then(|cursor| cursor.parse::<usize>().ok())
            .unwrap_or(0)
            .min(items.len());
        let Some(size) = self.page_size else {
            return (&items[start..], None);
        };
        let end = (start + size).min(items.len());
        let next = (end < items.len()).then(|| end.to_string());
        (&items[start..end], next)
    }
}

fn with_cursor(mut result: Value, next: Option<String>) -> Value {
    if let Some(next) = next {
        result["nextCursor"] = json!(next);
    }
    result
}

#[derive(Default)]
struct ServerState {
    catalog: Catalog,
    held: HashSet<String>,
    received: Vec<Value>,
}

/// Scripted MCP server on the peer side of a Local transport
pub struct MockServer {
    peer: LocalPeer,
    state: Arc<Mutex<ServerState>>,
    held: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
    replies: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub fn start(peer: LocalPeer) -> Self {
        let state = Arc::new(Mutex::new(ServerState::default()));
        let (held_tx, held_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn({
            let peer = peer.clone();
            let state = Arc::clone(&state);
            async move {
                while let Some(frame) = peer.recv_json().await {
                    let response = {
                        let mut state = state.lock();
                        state.received.push(frame.clone());

                        let method = frame["method"].as_str().map(str::to_string);
                        let Some(method) = method else {
                            // The client answering a server-initiated request
                            let _ = replies_tx.send(frame);
                            continue;
                        };
                        if frame.get("id").is_none() {
                            continue;
                        }
                        if state.held.contains(&method) {
                            let _ = held_tx.send(frame.clone());
                            continue;
                        }
                        state.catalog.respond(&frame)
                    };
                    peer.push_json(&response);
                }
            }
        });

        Self {
            peer,
            state,
            held: tokio::sync::Mutex::new(held_rx),
            replies: tokio::sync::Mutex::new(replies_rx),
            task,
        }
    }

    pub fn peer(&self) -> &LocalPeer {
        &self.peer
    }

    pub fn set_tools(&self, names: &[&str]) {
        self.state.lock().catalog.tools = names.iter().map(|name| name.to_string()).collect();
    }

    pub fn set_page_size(&self, size: usize) {
        self.state.lock().catalog.page_size = Some(size);
    }

    pub fn set_protocol_version(&self, version: &str) {
        self.state.lock().catalog.protocol_version = version.to_string();
    }

    /// Stop answering `method`; its requests go to [`MockServer::next_held`]
    pub fn hold(&self, method: &str) {
        self.state.lock().held.insert(method.to_string());
    }

    pub async fn next_held(&self) -> Value {
        self.held
            .lock()
            .await
            .recv()
            .await
            .expect("mock server stopped")
    }

    /// Next response the client sent to a server-initiated request
    pub async fn next_reply(&self) -> Value {
        self.replies
            .lock()
            .await
            .recv()
            .await
            .expect("mock server stopped")
    }

    pub fn received(&self) -> Vec<Value> {
        self.state.lock().received.clone()
    }

    /// Methods of every frame received, in arrival order
    pub fn received_methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|frame| frame["method"].as_str().map(str::to_string))
            .collect()
    }

    pub fn respond(&self, id: &Value, result: Value) -> bool {
        self.peer
            .push_json(&json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> bool {
        let mut frame = json!({"jsonrpc": "2.0", "method": method});
        if let Some(params) = params {
            frame["params"] = params;
        }
        self.peer.push_json(&frame)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A client over a fresh Local pair, with a mock server on the other end
pub fn local_client(config: ClientConfig) -> (McpClient, MockServer) {
    let (transport, peer) = LocalTransport::pair();
    let client = McpClient::new(Box::new(transport), config);
    (client, MockServer::start(peer))
}

/// Records every event the client publishes
pub fn record_events(client: &McpClient) -> Arc<Mutex<Vec<ClientEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    client.on_event(move |event| sink.lock().push(event.clone()));
    events
}

/// Wait for the first event matching `predicate`
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<ClientEvent>,
    limit: Duration,
    mut predicate: F,
) -> anyhow::Result<ClientEvent>
where
    F: FnMut(&ClientEvent) -> bool,
{
    let found = tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    anyhow::bail!("event bus closed")
                }
            }
        }
    })
    .await;

    match found {
        Ok(result) => result,
        Err(_) => anyhow::bail!("no matching event within {:?}", limit),
    }
}
