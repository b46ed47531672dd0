//! Client-level counters

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Snapshot of client activity
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientStatistics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub requests_completed: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub reconnections: u64,
    pub queued_messages: u64,
    /// Running mean over completed requests
    pub avg_latency_ms: f64,
    pub connected_since: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ClientStatistics {
    pub(crate) fn record_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
        self.last_activity = Some(Utc::now());
    }

    pub(crate) fn record_received(&mut self, bytes: usize) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
        self.last_activity = Some(Utc::now());
    }

    pub(crate) fn record_latency(&mut self, latency: Duration) {
        self.requests_completed += 1;
        let sample = latency.as_secs_f64() * 1000.0;
        let n = self.requests_completed as f64;
        self.avg_latency_ms += (sample - self.avg_latency_ms) / n;
    }
}
