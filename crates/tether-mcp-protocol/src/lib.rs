//! # Model Context Protocol (MCP) types for the tether client
//!
//! Protocol payloads the client exchanges with an MCP server, the method names
//! it uses, and the [`validation`] module that guards every inbound frame.
//!
//! ## Features
//! - Initialize handshake types and protocol version negotiation
//! - Tools, resources and prompts discovery and invocation payloads
//! - Structured message validation with configurable resource-safety limits

pub mod content;
pub mod initialize;
pub mod methods;
pub mod prelude;
pub mod prompts;
pub mod resources;
pub mod tools;
pub mod validation;
pub mod version;

// Re-export main types
pub use content::ContentBlock;
pub use initialize::{
    ClientCapabilities, Implementation, InitializeParams, InitializeResult, ServerCapabilities,
};
pub use prompts::{
    GetPromptParams, GetPromptResult, ListPromptsResult, Prompt, PromptArgument, PromptMessage,
    Role,
};
pub use resources::{
    ListResourcesResult, ReadResourceParams, ReadResourceResult, Resource, ResourceContent,
};
pub use tools::{CallToolParams, CallToolResult, ListToolsResult, Tool, ToolSchema};
pub use validation::{MessageValidator, ValidationError, ValidationLimits, ValidationResult};
pub use version::McpVersion;

pub use tether_mcp_json_rpc as json_rpc;

/// Common result type for MCP protocol operations
pub type McpResult<T> = Result<T, McpError>;

/// MCP protocol-level errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum McpError {
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}
