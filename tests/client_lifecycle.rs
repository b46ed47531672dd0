//! Connection lifecycle over the Local transport
//!
//! Handshake, discovery, teardown and the handling of server-initiated
//! traffic, all against the scripted [`support::MockServer`].

mod support;

use anyhow::{Context, Result};
use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use support::{init_tracing, local_client, record_events, reconnecting_config, test_config, wait_for_event};
use tether_mcp_client::{ClientEvent, ClientStatus, ErrorKind, RequestOptions, codes};
use tether_mcp_protocol::McpVersion;

#[tokio::test]
async fn test_connect_runs_handshake_then_discovery() -> Result<()> {
    init_tracing();
    let (client, server) = local_client(test_config());
    let events = record_events(&client);

    client.connect().await?;

    assert_eq!(client.status(), ClientStatus::Connected);
    let info = client.server().context("no server info after connect")?;
    assert_eq!(info.server_info.name, "mock-server");
    assert_eq!(info.protocol_version, McpVersion::CURRENT.as_str());

    let tools: Vec<String> = client.tools().into_iter().map(|tool| tool.name).collect();
    assert_eq!(tools, vec!["echo"]);
    assert_eq!(client.resources()[0].uri, "file:///notes.txt");
    assert_eq!(client.prompts()[0].name, "greeting");

    assert_eq!(
        server.received_methods(),
        vec![
            "initialize",
            "notifications/initialized",
            "tools/list",
            "resources/list",
            "prompts/list"
        ]
    );

    let initialize = &server.received()[0];
    assert_eq!(initialize["params"]["protocolVersion"], McpVersion::CURRENT.as_str());
    assert_eq!(
        initialize["params"]["clientInfo"]["name"],
        client.config().client_info.name
    );

    // Connected comes last, after discovery
    let names: Vec<&'static str> = events.lock().iter().map(ClientEvent::name).collect();
    assert_eq!(names, vec!["status_change", "status_change", "connected"]);
    Ok(())
}

#[tokio::test]
async fn test_second_connect_is_a_no_op() -> Result<()> {
    let (client, server) = local_client(test_config());

    client.connect().await?;
    client.connect().await?;

    assert_eq!(server.received_methods().len(), 5);
    assert_eq!(server.peer().connect_attempts(), 1);
    assert_eq!(client.status_history().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_disconnect_then_connect_again() -> Result<()> {
    let (client, server) = local_client(test_config());
    let events = record_events(&client);

    client.connect().await?;
    client.disconnect().await?;
    assert_eq!(client.status(), ClientStatus::Disconnected);
    assert!(!server.peer().is_connected());

    client.connect().await?;
    assert_eq!(client.status(), ClientStatus::Connected);
    assert_eq!(server.peer().connect_attempts(), 2);

    let path: Vec<ClientStatus> = client.status_history().iter().map(|t| t.to).collect();
    assert_eq!(
        path,
        vec![
            ClientStatus::Connecting,
            ClientStatus::Connected,
            ClientStatus::Disconnecting,
            ClientStatus::Disconnected,
            ClientStatus::Connecting,
            ClientStatus::Connected,
        ]
    );

    let disconnects: Vec<Option<u16>> = events
        .lock()
        .iter()
        .filter_map(|event| match event {
            ClientEvent::Disconnected { code, .. } => Some(*code),
            _ => None,
        })
        .collect();
    assert_eq!(disconnects, vec![Some(1000)]);
    Ok(())
}

#[tokio::test]
async fn test_disconnect_rejects_in_flight_requests() -> Result<()> {
    let (client, server) = local_client(test_config());
    server.hold("slow");
    client.connect().await?;

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.request("slow", None).await }
    });
    server.next_held().await;
    assert_eq!(client.pending_requests(), 1);

    client.disconnect().await?;

    let err = pending.await?.unwrap_err();
    assert_eq!(err.code, codes::CONNECTION_CLOSING);
    assert_eq!(client.pending_requests(), 0);
    Ok(())
}

#[tokio::test]
async fn test_destroy_rejects_every_pending_request() -> Result<()> {
    let (client, server) = local_client(test_config());
    server.hold("slow");
    client.connect().await?;
    let mut events = client.subscribe();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let client = client.clone();
        handles.push(tokio::spawn(async move { client.request("slow", None).await }));
    }
    for _ in 0..5 {
        server.next_held().await;
    }
    assert_eq!(client.pending_requests(), 5);

    client.destroy().await;

    for handle in handles {
        let err = handle.await?.unwrap_err();
        assert_eq!(err.code, codes::CONNECTION_CLOSING);
    }
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.status(), ClientStatus::Closed);

    // Every subscription ends
    loop {
        match events.recv().await {
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }

    // Idempotent, and terminal
    client.destroy().await;
    let err = client.connect().await.unwrap_err();
    assert_eq!(err.code, codes::INVALID_STATE);
    Ok(())
}

#[tokio::test]
async fn test_initial_connect_failure_ends_in_error_without_retrying() -> Result<()> {
    let (client, server) = local_client(reconnecting_config(Duration::from_millis(10), 3));
    let events = record_events(&client);
    server.peer().refuse_connections(true);

    let err = client.connect().await.unwrap_err();
    assert_eq!(err.code, codes::CONNECTION_FAILED);
    assert_eq!(client.status(), ClientStatus::Error);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.peer().connect_attempts(), 1);
    assert!(
        events
            .lock()
            .iter()
            .all(|event| !matches!(event, ClientEvent::Reconnecting { .. }))
    );

    // Error is recoverable through connect()
    server.peer().refuse_connections(false);
    client.connect().await?;
    assert_eq!(client.status(), ClientStatus::Connected);
    Ok(())
}

#[tokio::test]
async fn test_unsupported_protocol_version_fails_handshake() -> Result<()> {
    let (client, server) = local_client(test_config());
    server.set_protocol_version("1999-01-01");

    let err = client.connect().await.unwrap_err();
    assert_eq!(err.code, codes::VERSION_MISMATCH);
    assert_eq!(err.kind, ErrorKind::Protocol);
    assert_eq!(client.status(), ClientStatus::Error);
    assert!(!server.received_methods().contains(&"notifications/initialized".to_string()));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_slow_transport_connect_times_out() -> Result<()> {
    let (client, server) = local_client(test_config());
    server.peer().set_connect_delay(Duration::from_secs(60));

    let started = tokio::time::Instant::now();
    let err = client.connect().await.unwrap_err();

    assert_eq!(err.code, codes::CONNECTION_TIMEOUT);
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(started.elapsed(), client.config().timeouts.connect);
    Ok(())
}

#[tokio::test]
async fn test_list_changed_notification_refreshes_cache() -> Result<()> {
    let (client, server) = local_client(test_config());
    client.connect().await?;
    let mut events = client.subscribe();

    server.set_tools(&["echo", "search"]);
    assert!(server.notify("notifications/tools/list_changed", None));

    let event = wait_for_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, ClientEvent::ToolsUpdated(_))
    })
    .await?;
    let ClientEvent::ToolsUpdated(tools) = event else {
        unreachable!()
    };
    assert_eq!(tools.len(), 2);
    assert_eq!(client.tools().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_other_notifications_surface_as_messages() -> Result<()> {
    let (client, server) = local_client(test_config());
    client.connect().await?;
    let mut events = client.subscribe();

    server.notify(
        "notifications/message",
        Some(json!({"level": "info", "data": "indexing done"})),
    );

    let event = wait_for_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, ClientEvent::Message(_))
    })
    .await?;
    let ClientEvent::Message(message) = event else {
        unreachable!()
    };
    assert_eq!(message["method"], "notifications/message");
    assert_eq!(message["params"]["data"], "indexing done");
    Ok(())
}

#[tokio::test]
async fn test_server_ping_is_answered() -> Result<()> {
    let (client, server) = local_client(test_config());
    client.connect().await?;

    server
        .peer()
        .push_json(&json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"}));

    let reply = server.next_reply().await;
    assert_eq!(reply["id"], "srv-1");
    assert_eq!(reply["result"], json!({}));
    Ok(())
}

#[tokio::test]
async fn test_unknown_server_request_gets_method_not_found() -> Result<()> {
    let (client, server) = local_client(test_config());
    client.connect().await?;
    let mut events = client.subscribe();

    server.peer().push_json(&json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "sampling/createMessage",
        "params": {"messages": []}
    }));

    let reply = server.next_reply().await;
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["error"]["code"], -32601);

    let event = wait_for_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, ClientEvent::Message(_))
    })
    .await?;
    let ClientEvent::Message(message) = event else {
        unreachable!()
    };
    assert_eq!(message["method"], "sampling/createMessage");
    Ok(())
}

#[tokio::test]
async fn test_discovery_follows_pagination() -> Result<()> {
    let (client, server) = local_client(test_config());
    server.set_tools(&["a", "b", "c", "d", "e"]);
    server.set_page_size(2);

    client.connect().await?;

    let tools: Vec<String> = client.tools().into_iter().map(|tool| tool.name).collect();
    assert_eq!(tools, vec!["a", "b", "c", "d", "e"]);

    let pages = server
        .received_methods()
        .iter()
        .filter(|method| *method == "tools/list")
        .count();
    assert_eq!(pages, 3);
    Ok(())
}

#[tokio::test]
async fn test_resources_and_prompts() -> Result<()> {
    let (client, _server) = local_client(test_config());
    client.connect().await?;

    let read = client
        .get_resource("file:///notes.txt", RequestOptions::default())
        .await?;
    assert_eq!(read.contents[0].uri(), "file:///notes.txt");

    let err = client
        .get_resource("file:///missing.txt", RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, codes::RESOURCE_NOT_FOUND);

    let err = client
        .get_resource("file:///missing.txt", RequestOptions::default().skip_local_check())
        .await
        .unwrap_err();
    assert_eq!(err.code, codes::RESOURCE_READ_FAILED);
    assert_eq!(err.server_code, Some(-32002));
    assert_eq!(err.message, "Resource not found: file:///missing.txt");

    let prompt = client.get_prompt("greeting", None).await?;
    assert_eq!(prompt.messages[0].content.as_text(), Some("Hello from greeting"));

    client.ping().await?;
    Ok(())
}

#[tokio::test]
async fn test_connection_status_and_callbacks() -> Result<()> {
    let (client, _server) = local_client(test_config());
    let events = record_events(&client);
    let muted = std::sync::Arc::new(parking_lot::Mutex::new(0usize));
    let id = client.on_event({
        let muted = std::sync::Arc::clone(&muted);
        move |_| *muted.lock() += 1
    });
    assert!(client.unsubscribe(id));
    assert!(!client.unsubscribe(id));

    client.connect().await?;

    let status = client.connection_status().await;
    assert!(status.is_ready());
    assert_eq!(status.pending_requests, 0);
    assert!(status.summary().starts_with("Local transport to local - connected"));

    assert_eq!(*muted.lock(), 0);
    assert!(!events.lock().is_empty());

    let stats = client.stats();
    assert_eq!(stats.messages_sent, 5);
    assert_eq!(stats.messages_received, 4);
    assert_eq!(stats.requests_completed, 4);
    assert!(stats.connected_since.is_some());
    Ok(())
}
