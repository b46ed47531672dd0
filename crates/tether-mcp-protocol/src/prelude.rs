//! # MCP Protocol Prelude
//!
//! ```rust
//! use tether_mcp_protocol::prelude::*;
//! ```

pub use crate::content::ContentBlock;
pub use crate::initialize::{
    ClientCapabilities, Implementation, InitializeParams, InitializeResult, ServerCapabilities,
};
pub use crate::methods;
pub use crate::prompts::{GetPromptResult, Prompt, PromptArgument, PromptMessage};
pub use crate::resources::{ReadResourceResult, Resource, ResourceContent};
pub use crate::tools::{CallToolResult, Tool, ToolSchema};
pub use crate::validation::{MessageValidator, ValidationError, ValidationLimits};
pub use crate::version::McpVersion;
pub use crate::{McpError, McpResult};
