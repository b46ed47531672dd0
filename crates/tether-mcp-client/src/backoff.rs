//! Reconnection scheduling

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Stateful walk through the delays of a [`ReconnectConfig`]
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Advance to the next attempt, returning its number and delay,
    /// or `None` once `max_attempts` have been handed out
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if !self.config.should_retry(self.attempt) {
            return None;
        }
        self.attempt += 1;
        Some((self.attempt, self.config.delay_for_attempt(self.attempt)))
    }

    /// Attempts handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            auto_reconnect: true,
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_sequence_then_exhaustion() {
        let mut backoff = Backoff::new(config());

        assert_eq!(backoff.next_attempt(), Some((1, Duration::from_millis(100))));
        assert_eq!(backoff.next_attempt(), Some((2, Duration::from_millis(200))));
        assert_eq!(backoff.next_attempt(), Some((3, Duration::from_millis(400))));
        assert_eq!(backoff.next_attempt(), None);
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let mut backoff = Backoff::new(ReconnectConfig {
            max_attempts: 0,
            ..config()
        });
        assert_eq!(backoff.next_attempt(), None);
        assert_eq!(backoff.attempts(), 0);
    }
}
