//! Liveness tracking for the active connection

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{HeartbeatConfig, HeartbeatMode};

/// What the heartbeat task sends each interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    Notification,
    PingRequest,
}

/// Records when the peer was last heard from
#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    config: HeartbeatConfig,
    last_seen: Mutex<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Any inbound frame or transport heartbeat counts as proof of life
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn silence(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn is_expired(&self) -> bool {
        !self.config.liveness_timeout.is_zero() && self.silence() > self.config.liveness_timeout
    }

    /// Tick period of the client-side task; `None` when the client sends nothing
    pub fn interval(&self) -> Option<Duration> {
        match self.config.mode {
            HeartbeatMode::Disabled | HeartbeatMode::TransportPing => None,
            HeartbeatMode::Notification | HeartbeatMode::PingRequest => {
                Some(self.config.interval).filter(|interval| !interval.is_zero())
            }
        }
    }

    pub fn probe(&self) -> Option<Probe> {
        match self.config.mode {
            HeartbeatMode::Notification => Some(Probe::Notification),
            HeartbeatMode::PingRequest => Some(Probe::PingRequest),
            HeartbeatMode::Disabled | HeartbeatMode::TransportPing => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: HeartbeatMode) -> HeartbeatConfig {
        HeartbeatConfig {
            mode,
            interval: Duration::from_secs(1),
            liveness_timeout: Duration::from_secs(3),
        }
    }

    #[test]
    fn test_modes_without_client_probe() {
        for mode in [HeartbeatMode::Disabled, HeartbeatMode::TransportPing] {
            let monitor = HeartbeatMonitor::new(config(mode));
            assert_eq!(monitor.interval(), None);
            assert_eq!(monitor.probe(), None);
        }

        let monitor = HeartbeatMonitor::new(config(HeartbeatMode::PingRequest));
        assert_eq!(monitor.interval(), Some(Duration::from_secs(1)));
        assert_eq!(monitor.probe(), Some(Probe::PingRequest));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_expires_and_touch_resets() {
        let monitor = HeartbeatMonitor::new(config(HeartbeatMode::Notification));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!monitor.is_expired());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(monitor.is_expired());

        monitor.touch();
        assert!(!monitor.is_expired());
        assert!(monitor.silence() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_never_expires() {
        let monitor = HeartbeatMonitor::new(HeartbeatConfig {
            liveness_timeout: Duration::ZERO,
            ..config(HeartbeatMode::Notification)
        });
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!monitor.is_expired());
    }
}
