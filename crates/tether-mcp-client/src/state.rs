//! Client connection state machine

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Client-wide connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Disconnected,
    Error,
    /// Terminal; reached only through `destroy()`
    Closed,
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClientStatus::Idle => "idle",
            ClientStatus::Connecting => "connecting",
            ClientStatus::Connected => "connected",
            ClientStatus::Reconnecting => "reconnecting",
            ClientStatus::Disconnecting => "disconnecting",
            ClientStatus::Disconnected => "disconnected",
            ClientStatus::Error => "error",
            ClientStatus::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl ClientStatus {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: ClientStatus) -> bool {
        use ClientStatus::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnecting, Disconnected) => true,
            (_, Disconnecting) => true,
            (Idle | Disconnected | Error, Connecting) => true,
            (Reconnecting, Connecting) => true,
            (Connecting, Connected | Error | Reconnecting) => true,
            (Connected, Reconnecting | Disconnected) => true,
            (Reconnecting, Error) => true,
            _ => false,
        }
    }

    /// Outbound frames may be queued rather than rejected
    pub fn accepts_queueing(self) -> bool {
        matches!(self, ClientStatus::Connecting | ClientStatus::Reconnecting)
    }

    pub fn is_terminal(self) -> bool {
        self == ClientStatus::Closed
    }
}

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusTransition {
    pub from: ClientStatus,
    pub to: ClientStatus,
    pub at: DateTime<Utc>,
}

/// Bounded, timestamped log of status transitions
#[derive(Debug, Clone)]
pub struct StatusHistory {
    entries: VecDeque<StatusTransition>,
    capacity: usize,
}

impl StatusHistory {
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(Self::DEFAULT_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, from: ClientStatus, to: ClientStatus, at: DateTime<Utc>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(StatusTransition { from, to, at });
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<StatusTransition> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for StatusHistory {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
