//! Caller-visible client events
//!
//! Two ways to listen: [`EventBus::subscribe`] hands out a broadcast receiver
//! (drop it to unsubscribe), and [`EventBus::on_event`] registers a callback
//! that is removed again with [`EventBus::unsubscribe`]. Closing the bus ends
//! every subscription.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

use tether_mcp_protocol::{InitializeResult, Prompt, Resource, Tool};

use crate::error::McpClientError;
use crate::state::ClientStatus;

/// Events published by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake finished and discovery ran
    Connected {
        server: Box<InitializeResult>,
        timestamp: DateTime<Utc>,
    },
    Disconnected {
        code: Option<u16>,
        reason: String,
    },
    /// Inbound notification or server request not handled by the client itself
    Message(Value),
    Error(McpClientError),
    StatusChange {
        old: ClientStatus,
        new: ClientStatus,
        timestamp: DateTime<Utc>,
    },
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    ToolsUpdated(Vec<Tool>),
    ResourcesUpdated(Vec<Resource>),
    PromptsUpdated(Vec<Prompt>),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Connected { .. } => "connected",
            ClientEvent::Disconnected { .. } => "disconnected",
            ClientEvent::Message(_) => "message",
            ClientEvent::Error(_) => "error",
            ClientEvent::StatusChange { .. } => "status_change",
            ClientEvent::Reconnecting { .. } => "reconnecting",
            ClientEvent::ToolsUpdated(_) => "tools_updated",
            ClientEvent::ResourcesUpdated(_) => "resources_updated",
            ClientEvent::PromptsUpdated(_) => "prompts_updated",
        }
    }
}

/// Handle returned by [`EventBus::on_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type EventCallback = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

pub struct EventBus {
    sender: Mutex<Option<broadcast::Sender<ClientEvent>>>,
    callbacks: Mutex<Vec<(SubscriptionId, EventCallback)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("closed", &self.is_closed())
            .field("callbacks", &self.callbacks.lock().len())
            .finish()
    }
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            callbacks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Receive every event published from now on
    ///
    /// On a closed bus the receiver reports `Closed` straight away.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Register a callback; it runs on the publishing task and must not block
    pub fn on_event<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if !self.is_closed() {
            self.callbacks.lock().push((id, Arc::new(callback)));
        }
        id
    }

    /// Remove a callback; returns false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    pub fn emit(&self, event: ClientEvent) {
        trace!(event = event.name(), "Publishing client event");

        let callbacks: Vec<EventCallback> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(&event);
        }

        if let Some(sender) = self.sender.lock().as_ref() {
            // No receivers is not an error
            let _ = sender.send(event);
        }
    }

    /// End every subscription; later events are dropped
    pub fn close(&self) {
        self.sender.lock().take();
        self.callbacks.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Broadcast receivers plus registered callbacks
    pub fn listener_count(&self) -> usize {
        let receivers = self
            .sender
            .lock()
            .as_ref()
            .map(|sender| sender.receiver_count())
            .unwrap_or(0);
        receivers + self.callbacks.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disconnected() -> ClientEvent {
        ClientEvent::Disconnected {
            code: Some(1000),
            reason: "bye".to_string(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(disconnected());

        assert_eq!(first.recv().await.unwrap().name(), "disconnected");
        assert_eq!(second.recv().await.unwrap().name(), "disconnected");
    }

    #[test]
    fn test_callbacks_can_unsubscribe() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);

        let id = bus.on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(disconnected());
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(disconnected());

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_ends_all_subscriptions() {
        let bus = EventBus::default();
        let mut receiver = bus.subscribe();
        bus.on_event(|_| {});

        bus.close();
        assert!(bus.is_closed());
        assert_eq!(bus.listener_count(), 0);
        assert!(matches!(
            receiver.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        let mut late = bus.subscribe();
        assert!(matches!(
            late.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
