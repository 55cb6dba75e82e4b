//! MCP server implementation.

pub mod handler;
pub mod resources;
pub mod state;

pub use handler::McpHandler;
pub use resources::{PromptRegistry, ResourceRegistry};
pub use state::{ServerState, ServerStateBuilder};
