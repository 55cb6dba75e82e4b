//! MCP tool registry and built-in tools.

pub mod builtin;
pub mod registry;

pub use builtin::{CurrentTimeTool, EchoTool};
pub use registry::{FnTool, ToolHandler, ToolRegistry, ToolResult};

use std::sync::Arc;

/// Register the built-in tools, each name prefixed with `prefix` (may be empty).
pub fn register_builtins(registry: &ToolRegistry, prefix: &str) {
    registry.register(
        EchoTool::definition(&format!("{prefix}echo")),
        Arc::new(EchoTool),
    );
    registry.register(
        CurrentTimeTool::definition(&format!("{prefix}current_time")),
        Arc::new(CurrentTimeTool),
    );
}
