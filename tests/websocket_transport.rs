//! WebSocket transport against a real tokio-tungstenite server

mod support;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use serial_test::serial;
use tokio_test::assert_err;

use support::{Catalog, init_tracing, reconnecting_config, test_config, wait_for_event};
use tether_mcp_client::transport::{WebSocketConfig, WebSocketTransport};
use tether_mcp_client::{
    ClientConfig, ClientEvent, ClientStatus, ConnectionConfig, ErrorKind, McpClient,
    McpClientBuilder, RequestOptions, Transport, TransportType, codes,
};

/// Minimal MCP server speaking JSON-RPC over WebSocket text frames
struct WsServer {
    url: String,
    authorization: Arc<Mutex<Vec<Option<String>>>>,
    close: Arc<Notify>,
    silence: Arc<Notify>,
    task: JoinHandle<()>,
}

impl WsServer {
    async fn start(required_token: Option<&str>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("ws://{}/mcp", listener.local_addr()?);
        let authorization = Arc::new(Mutex::new(Vec::new()));
        let close = Arc::new(Notify::new());
        let silence = Arc::new(Notify::new());
        let required = required_token.map(|token| format!("Bearer {}", token));

        let task = tokio::spawn({
            let authorization = Arc::clone(&authorization);
            let close = Arc::clone(&close);
            let silence = Arc::clone(&silence);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve_connection(
                        stream,
                        required.clone(),
                        Arc::clone(&authorization),
                        Arc::clone(&close),
                        Arc::clone(&silence),
                    ));
                }
            }
        });

        Ok(Self {
            url,
            authorization,
            close,
            silence,
            task,
        })
    }

    fn authorization_headers(&self) -> Vec<Option<String>> {
        self.authorization.lock().clone()
    }

    /// Close the live connection with 1001 "going away"
    fn close_connection(&self) {
        self.close.notify_one();
    }

    /// Stop reading the live connection while keeping it open, so pings go unanswered
    fn go_silent(&self) {
        self.silence.notify_one();
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    required: Option<String>,
    authorization: Arc<Mutex<Vec<Option<String>>>>,
    close: Arc<Notify>,
    silence: Arc<Notify>,
) {
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let header = request
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        authorization.lock().push(header.clone());

        match &required {
            Some(expected) if header.as_deref() != Some(expected.as_str()) => {
                let mut rejection = ErrorResponse::new(Some("unauthorized".to_string()));
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                Err(rejection)
            }
            _ => Ok(response),
        }
    };

    let Ok(mut socket) = accept_hdr_async(stream, callback).await else {
        return;
    };
    let catalog = Catalog::default();

    loop {
        tokio::select! {
            _ = close.notified() => {
                let frame = CloseFrame {
                    code: CloseCode::Away,
                    reason: "server shutting down".into(),
                };
                let _ = socket.close(Some(frame)).await;
                break;
            }
            // The socket stays open but is never read again
            _ = silence.notified() => std::future::pending::<()>().await,
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(request) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    if request.get("method").is_none() || request.get("id").is_none() {
                        continue;
                    }
                    let reply = catalog.respond(&request);
                    if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                _ => break,
            }
        }
    }
}

fn client_for(url: &str, bearer_token: Option<&str>) -> Result<McpClient> {
    let config = ClientConfig {
        connection: ConnectionConfig {
            bearer_token: bearer_token.map(str::to_string),
            ..ConnectionConfig::default()
        },
        ..test_config()
    };
    client_with(url, config)
}

fn client_with(url: &str, config: ClientConfig) -> Result<McpClient> {
    Ok(McpClientBuilder::new()
        .with_url(url)?
        .with_config(config)
        .build()?)
}

#[tokio::test]
#[serial]
async fn test_round_trip_with_bearer_token() -> Result<()> {
    init_tracing();
    let server = WsServer::start(Some("secret-token")).await?;
    let client = client_for(&server.url, Some("secret-token"))?;

    client.connect().await?;

    assert_eq!(
        server.authorization_headers(),
        vec![Some("Bearer secret-token".to_string())]
    );
    let tools: Vec<String> = client.tools().into_iter().map(|tool| tool.name).collect();
    assert_eq!(tools, vec!["echo"]);

    let result = client
        .call_tool("echo", json!({"over": "websocket"}), RequestOptions::default())
        .await?;
    let echoed: Value = serde_json::from_str(&result.text())?;
    assert_eq!(echoed, json!({"over": "websocket"}));

    let status = client.connection_status().await;
    assert_eq!(status.transport_type, TransportType::WebSocket);
    assert_eq!(status.endpoint, server.url);

    let transport = client.transport_stats().await;
    assert!(transport.messages_sent >= 6);
    assert!(transport.messages_received >= 5);

    client.disconnect().await?;
    assert_eq!(client.status(), ClientStatus::Disconnected);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_server_close_is_reported_with_its_code() -> Result<()> {
    let server = WsServer::start(None).await?;
    let client = client_for(&server.url, None)?;
    client.connect().await?;
    let mut events = client.subscribe();

    server.close_connection();

    let event = wait_for_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, ClientEvent::Disconnected { .. })
    })
    .await?;
    assert!(matches!(
        event,
        ClientEvent::Disconnected { code: Some(1001), ref reason } if reason == "server shutting down"
    ));
    assert_eq!(client.status(), ClientStatus::Disconnected);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_rejected_upgrade_is_an_authentication_error() -> Result<()> {
    let server = WsServer::start(Some("secret-token")).await?;
    let client = client_for(&server.url, None)?;

    let err = assert_err!(client.connect().await);

    assert_eq!(err.code, codes::AUTHENTICATION_FAILED);
    assert_eq!(err.kind, ErrorKind::Authentication);
    assert_eq!(client.status(), ClientStatus::Error);
    assert_eq!(server.authorization_headers(), vec![None]);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_refused_connection_fails() -> Result<()> {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.port()
    };
    let client = client_for(&format!("ws://127.0.0.1:{}/mcp", port), None)?;

    let err = assert_err!(client.connect().await);
    assert_eq!(err.code, codes::CONNECTION_FAILED);
    assert_eq!(client.status(), ClientStatus::Error);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_connection_info_redacts_credentials() -> Result<()> {
    let connection = ConnectionConfig {
        bearer_token: Some("secret-token".to_string()),
        user_agent: Some("tether-tests/1.0".to_string()),
        ..ConnectionConfig::default()
    };

    let redacted = WebSocketTransport::new("ws://127.0.0.1:9/mcp")?
        .with_connection(connection.clone())
        .with_redaction(true)
        .connection_info();
    assert_eq!(redacted.metadata["headers"]["Authorization"], "[redacted]");
    assert_eq!(redacted.metadata["headers"]["User-Agent"], "tether-tests/1.0");

    let visible = WebSocketTransport::new("ws://127.0.0.1:9/mcp")?
        .with_connection(connection)
        .with_redaction(false)
        .connection_info();
    assert_eq!(visible.metadata["headers"]["Authorization"], "Bearer secret-token");
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_missing_pong_drops_socket_and_reconnects() -> Result<()> {
    let server = WsServer::start(None).await?;
    let config = ClientConfig {
        websocket: WebSocketConfig {
            ping_interval: Duration::from_millis(200),
            pong_timeout: Duration::from_millis(300),
            ..WebSocketConfig::default()
        },
        ..reconnecting_config(Duration::from_millis(50), 3)
    };
    let client = client_with(&server.url, config)?;
    client.connect().await?;
    let mut events = client.subscribe();

    server.go_silent();

    let event = wait_for_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, ClientEvent::Disconnected { .. })
    })
    .await?;
    assert!(matches!(
        event,
        ClientEvent::Disconnected { code: Some(1006), ref reason } if reason == "pong timeout"
    ));

    wait_for_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, ClientEvent::Reconnecting { attempt: 1, .. })
    })
    .await?;
    wait_for_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, ClientEvent::Connected { .. })
    })
    .await?;

    assert_eq!(client.status(), ClientStatus::Connected);
    assert_eq!(client.stats().reconnections, 1);
    assert_eq!(server.authorization_headers().len(), 2);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_oversized_frame_is_rejected() -> Result<()> {
    let server = WsServer::start(None).await?;
    let config = ClientConfig {
        websocket: WebSocketConfig {
            max_message_size: 4096,
            ..WebSocketConfig::default()
        },
        ..test_config()
    };
    let client = client_with(&server.url, config)?;
    client.connect().await?;

    let blob = "x".repeat(8192);
    let err = assert_err!(client.request("echo", Some(json!({ "blob": blob }))).await);

    assert_eq!(err.code, codes::MESSAGE_TOO_LARGE);
    assert_eq!(err.kind, ErrorKind::Transport);
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.status(), ClientStatus::Connected);

    let echoed = client.request("echo", Some(json!({"small": true}))).await?;
    assert_eq!(echoed, json!({"small": true}));
    Ok(())
}
