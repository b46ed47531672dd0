//! Configuration types for MCP client

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use tether_mcp_protocol::{Implementation, ValidationLimits};

use crate::transport::{SseConfig, WebSocketConfig};

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Identity sent in `initialize`
    pub client_info: Implementation,

    pub timeouts: TimeoutConfig,

    pub reconnect: ReconnectConfig,

    pub heartbeat: HeartbeatConfig,

    /// Credentials and headers attached to the transport
    pub connection: ConnectionConfig,

    pub limits: LimitsConfig,

    pub logging: LoggingConfig,

    /// Applied when the transport is built from a `ws://` or `wss://` URL
    pub websocket: WebSocketConfig,

    /// Applied when the transport is built from an `http://` or `https://` URL
    pub sse: SseConfig,
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound for the transport to open
    #[serde(with = "duration_serde")]
    pub connect: Duration,

    /// Default per-request timeout
    #[serde(with = "duration_serde")]
    pub request: Duration,

    /// Timeout for the `initialize` handshake
    #[serde(with = "duration_serde")]
    pub initialization: Duration,
}

/// Reconnection policy applied after an unexpected disconnect
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub auto_reconnect: bool,

    pub max_attempts: u32,

    #[serde(with = "duration_serde")]
    pub initial_delay: Duration,

    #[serde(with = "duration_serde")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

/// How liveness is probed while connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatMode {
    Disabled,
    /// Rely on the transport's own keep-alive (WebSocket ping/pong)
    TransportPing,
    /// Send `notifications/heartbeat` every interval
    Notification,
    /// Send an MCP `ping` request every interval
    PingRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub mode: HeartbeatMode,

    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Silence longer than this is treated as a dead connection
    #[serde(with = "duration_serde")]
    pub liveness_timeout: Duration,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub user_agent: Option<String>,

    /// Custom headers to include on the upgrade / stream request
    pub headers: HashMap<String, String>,

    /// Sent as `Authorization: Bearer <token>`
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    #[serde(flatten)]
    pub validation: ValidationLimits,

    /// Messages buffered while connecting or reconnecting
    pub max_queue_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log every frame body at `trace` level
    pub log_messages: bool,

    /// Mask credential headers in connection info
    pub redact_sensitive: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            request: Duration::from_secs(30),
            initialization: Duration::from_secs(15),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            mode: HeartbeatMode::TransportPing,
            interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(90),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            user_agent: Some(format!("tether-mcp-client/{}", env!("CARGO_PKG_VERSION"))),
            headers: HashMap::new(),
            bearer_token: None,
        }
    }
}

impl ConnectionConfig {
    /// Every header to send, including `Authorization` and `User-Agent`
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        if let Some(token) = &self.bearer_token {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        if let Some(user_agent) = &self.user_agent {
            headers.push(("User-Agent".to_string(), user_agent.clone()));
        }
        headers
    }

    /// Header names and values safe to show in logs
    pub fn display_headers(&self, redact: bool) -> HashMap<String, String> {
        self.request_headers()
            .into_iter()
            .map(|(name, value)| {
                if redact && is_sensitive_header(&name) {
                    (name, "[redacted]".to_string())
                } else {
                    (name, value)
                }
            })
            .collect()
    }
}

fn is_sensitive_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name == "authorization"
        || name == "cookie"
        || name == "proxy-authorization"
        || name.contains("token")
        || name.contains("api-key")
        || name.contains("secret")
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            validation: ValidationLimits::default(),
            max_queue_size: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_messages: false,
            redact_sensitive: true,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect `attempt` (1-based), capped at `max_delay` even after jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let multiplier = self.backoff_multiplier.powi((attempt - 1) as i32);
        let mut delay = Duration::from_millis((self.initial_delay.as_millis() as f64 * multiplier) as u64);

        if delay > self.max_delay {
            delay = self.max_delay;
        }

        if self.jitter > 0.0 {
            let jitter_ms = (delay.as_millis() as f64 * self.jitter) as u64;
            let random_offset = rand::random::<f64>() * jitter_ms as f64;
            delay = Duration::from_millis(delay.as_millis() as u64 + random_offset as u64);
        }

        if delay > self.max_delay {
            delay = self.max_delay;
        }

        delay
    }

    /// Check if another attempt is allowed after `attempt` attempts were made
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

// Durations travel as integer milliseconds
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
