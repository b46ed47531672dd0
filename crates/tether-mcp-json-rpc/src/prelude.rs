//! # JSON-RPC Prelude
//!
//! This module provides convenient re-exports of the most commonly used types.
//!
//! ```rust
//! use tether_mcp_json_rpc::prelude::*;
//! ```

// Core JSON-RPC types
pub use crate::error::{JsonRpcErrorCode, JsonRpcErrorObject};
pub use crate::message::JsonRpcMessage;
pub use crate::notification::JsonRpcNotification;
pub use crate::request::JsonRpcRequest;
pub use crate::response::{JsonRpcResponse, ResponsePayload};
pub use crate::types::{JsonRpcVersion, RequestId};

// Standard error codes
pub use crate::error_codes::*;
