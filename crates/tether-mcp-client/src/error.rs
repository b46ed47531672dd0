//! Error types for MCP client operations
//!
//! Every failure the client reports is a [`McpClientError`]: a kind, a numeric
//! code from a fixed range, and enough context to decide whether to retry.
//!
//! | Range | Category    |
//! |-------|-------------|
//! | 1xxx  | transport   |
//! | 2xxx  | protocol    |
//! | 3xxx  | application (tools 30xx, resources 31xx) |
//! | 4xxx  | client-side |
//! | 5xxx  | server-reported |

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use tether_mcp_json_rpc::JsonRpcErrorObject;
use tether_mcp_protocol::{McpError, ValidationError};

/// Result type for MCP client operations
pub type McpClientResult<T> = Result<T, McpClientError>;

/// Numeric error codes
pub mod codes {
    // Transport
    pub const CONNECTION_FAILED: u32 = 1000;
    pub const CONNECTION_CLOSED: u32 = 1001;
    pub const NOT_CONNECTED: u32 = 1002;
    pub const SEND_FAILED: u32 = 1003;
    pub const MESSAGE_TOO_LARGE: u32 = 1004;
    pub const HEARTBEAT_TIMEOUT: u32 = 1005;
    pub const UNSUPPORTED_TRANSPORT: u32 = 1006;
    pub const QUEUE_FULL: u32 = 1007;

    // Protocol
    pub const INVALID_MESSAGE: u32 = 2000;
    pub const PARSE_ERROR: u32 = 2001;
    pub const HANDSHAKE_FAILED: u32 = 2002;
    pub const VERSION_MISMATCH: u32 = 2003;
    pub const UNEXPECTED_RESPONSE: u32 = 2004;

    // Application
    pub const TOOL_NOT_FOUND: u32 = 3000;
    pub const TOOL_EXECUTION_FAILED: u32 = 3001;
    pub const RESOURCE_NOT_FOUND: u32 = 3100;
    pub const RESOURCE_READ_FAILED: u32 = 3101;

    // Client-side
    pub const VALIDATION_FAILED: u32 = 4000;
    pub const REQUEST_TIMEOUT: u32 = 4001;
    pub const CONNECTION_TIMEOUT: u32 = 4002;
    pub const INVALID_STATE: u32 = 4003;
    pub const CONNECTION_CLOSING: u32 = 4004;
    pub const RECONNECT_EXHAUSTED: u32 = 4005;
    pub const AUTHENTICATION_FAILED: u32 = 4010;
    pub const AUTHORIZATION_FAILED: u32 = 4011;

    // Server-reported
    pub const SERVER_ERROR: u32 = 5000;
}

/// What went wrong, at the coarsest level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Protocol,
    Tool,
    Resource,
    Authentication,
    Timeout,
    Retry,
    Validation,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Tool => "tool",
            ErrorKind::Resource => "resource",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Retry => "retry",
            ErrorKind::Validation => "validation",
        };
        f.write_str(name)
    }
}

/// Category derived from the numeric code range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Application,
    Client,
    Server,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// The single error type surfaced by the client
#[derive(Error, Debug, Clone, Serialize)]
#[error("{kind} error {code}: {message}")]
pub struct McpClientError {
    pub kind: ErrorKind,
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// JSON-RPC code reported by the peer, when the error came from one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl McpClientError {
    pub fn new(kind: ErrorKind, code: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            data: None,
            server_code: None,
            cause: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    fn with_server_error(mut self, error: &JsonRpcErrorObject) -> Self {
        self.server_code = Some(error.code);
        self.data = error.data.clone();
        self
    }

    // Transport

    pub fn transport(code: u32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, code, message)
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::transport(codes::CONNECTION_FAILED, message)
    }

    pub fn not_connected() -> Self {
        Self::transport(codes::NOT_CONNECTED, "Transport is not connected")
    }

    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Self::transport(codes::CONNECTION_CLOSED, reason)
    }

    pub fn send_failed(cause: impl std::fmt::Display) -> Self {
        Self::transport(codes::SEND_FAILED, "Failed to send message").with_cause(cause)
    }

    pub fn message_too_large(size: usize, limit: usize) -> Self {
        Self::transport(
            codes::MESSAGE_TOO_LARGE,
            format!("Message of {} bytes exceeds limit of {} bytes", size, limit),
        )
    }

    pub fn unsupported_transport(message: impl Into<String>) -> Self {
        Self::transport(codes::UNSUPPORTED_TRANSPORT, message)
    }

    // Protocol

    pub fn protocol(code: u32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, code, message)
    }

    pub fn handshake_failed(message: impl Into<String>) -> Self {
        Self::protocol(codes::HANDSHAKE_FAILED, message)
    }

    pub fn unexpected_response(method: &str, cause: impl std::fmt::Display) -> Self {
        Self::protocol(
            codes::UNEXPECTED_RESPONSE,
            format!("Unexpected result shape for '{}'", method),
        )
        .with_cause(cause)
    }

    /// A peer `error` answer to a plain request
    pub fn server(error: &JsonRpcErrorObject) -> Self {
        Self::protocol(codes::SERVER_ERROR, error.message.clone()).with_server_error(error)
    }

    /// An inbound frame that failed validation
    pub fn invalid_message(error: &ValidationError) -> Self {
        Self::protocol(
            codes::INVALID_MESSAGE,
            format!("Invalid inbound message: {}", error),
        )
        .with_data(serde_json::json!({ "path": error.path, "reason": error.reason }))
    }

    /// The peer's error object, when this error came from one
    pub fn server_error_object(&self) -> Option<JsonRpcErrorObject> {
        self.server_code.map(|code| JsonRpcErrorObject {
            code,
            message: self.message.clone(),
            data: self.data.clone(),
        })
    }

    // Application

    pub fn tool_not_found(name: &str) -> Self {
        Self::new(
            ErrorKind::Tool,
            codes::TOOL_NOT_FOUND,
            format!("Tool '{}' is not offered by the server", name),
        )
    }

    /// A peer `error` answer to `tools/call`; the peer's message is kept verbatim
    pub fn tool_failed(error: &JsonRpcErrorObject) -> Self {
        Self::new(
            ErrorKind::Tool,
            codes::TOOL_EXECUTION_FAILED,
            error.message.clone(),
        )
        .with_server_error(error)
    }

    pub fn resource_not_found(uri: &str) -> Self {
        Self::new(
            ErrorKind::Resource,
            codes::RESOURCE_NOT_FOUND,
            format!("Resource '{}' is not offered by the server", uri),
        )
    }

    pub fn resource_failed(error: &JsonRpcErrorObject) -> Self {
        Self::new(
            ErrorKind::Resource,
            codes::RESOURCE_READ_FAILED,
            error.message.clone(),
        )
        .with_server_error(error)
    }

    // Client-side

    pub fn validation(error: &ValidationError) -> Self {
        Self::new(
            ErrorKind::Validation,
            codes::VALIDATION_FAILED,
            error.to_string(),
        )
        .with_data(serde_json::json!({ "path": error.path, "reason": error.reason }))
    }

    pub fn request_timeout(method: &str, after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            codes::REQUEST_TIMEOUT,
            format!("Request '{}' timed out after {}ms", method, after.as_millis()),
        )
    }

    pub fn connection_timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            codes::CONNECTION_TIMEOUT,
            format!("Connection attempt timed out after {}ms", after.as_millis()),
        )
    }

    pub fn queue_full(capacity: usize) -> Self {
        Self::transport(
            codes::QUEUE_FULL,
            format!("Outbound queue is full ({} messages)", capacity),
        )
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, codes::INVALID_STATE, message)
    }

    pub fn connection_closing() -> Self {
        Self::new(
            ErrorKind::Validation,
            codes::CONNECTION_CLOSING,
            "Connection is closing; request abandoned",
        )
    }

    pub fn reconnect_exhausted(attempts: u32) -> Self {
        Self::new(
            ErrorKind::Retry,
            codes::RECONNECT_EXHAUSTED,
            format!("Reconnection failed after {} attempts", attempts),
        )
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Authentication,
            codes::AUTHENTICATION_FAILED,
            message,
        )
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Authentication,
            codes::AUTHORIZATION_FAILED,
            message,
        )
    }

    /// Category from the numeric range of `code`
    pub fn category(&self) -> ErrorCategory {
        match self.code {
            1000..=1999 => ErrorCategory::Transport,
            2000..=2999 => ErrorCategory::Protocol,
            3000..=3999 => ErrorCategory::Application,
            4000..=4999 => ErrorCategory::Client,
            5000..=5999 => ErrorCategory::Server,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Whether retrying the same operation later can reasonably succeed
    pub fn is_recoverable(&self) -> bool {
        match self.code {
            codes::MESSAGE_TOO_LARGE | codes::UNSUPPORTED_TRANSPORT => false,
            1000..=1999 => true,
            codes::REQUEST_TIMEOUT | codes::CONNECTION_TIMEOUT => true,
            codes::SERVER_ERROR..=5999 => true,
            _ => false,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.code {
            codes::AUTHENTICATION_FAILED | codes::AUTHORIZATION_FAILED => ErrorSeverity::High,
            codes::RECONNECT_EXHAUSTED => ErrorSeverity::High,
            codes::REQUEST_TIMEOUT | codes::CONNECTION_TIMEOUT => ErrorSeverity::Medium,
            1000..=1999 => ErrorSeverity::Medium,
            2000..=2999 => ErrorSeverity::High,
            codes::SERVER_ERROR..=5999 => ErrorSeverity::Critical,
            _ => ErrorSeverity::Low,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}

impl From<ValidationError> for McpClientError {
    fn from(error: ValidationError) -> Self {
        Self::validation(&error)
    }
}

impl From<McpError> for McpClientError {
    fn from(error: McpError) -> Self {
        match error {
            McpError::VersionMismatch { .. } => {
                Self::protocol(codes::VERSION_MISMATCH, error.to_string())
            }
            McpError::Validation(validation) => Self::validation(&validation),
        }
    }
}

impl From<reqwest::Error> for McpClientError {
    fn from(error: reqwest::Error) -> Self {
        match error.status().map(|status| status.as_u16()) {
            Some(401) => Self::authentication("Server rejected credentials (HTTP 401)"),
            Some(403) => Self::authorization("Server refused access (HTTP 403)"),
            _ if error.is_timeout() => Self::new(
                ErrorKind::Timeout,
                codes::CONNECTION_TIMEOUT,
                "HTTP request timed out",
            ),
            _ => Self::connection_failed("HTTP request failed"),
        }
        .with_cause(error)
    }
}
