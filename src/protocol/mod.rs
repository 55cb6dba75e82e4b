//! MCP protocol implementation over JSON-RPC 2.0.

pub mod codec;
pub mod handler;
pub mod server;
pub mod types;

pub use codec::{
    create_error_response, create_notification, create_request, create_response, parse_message,
    parse_response, recover_id, serialize, serialize_response,
};
pub use handler::{Dispatcher, Handler, ServerSession, SessionState};
pub use server::{McpServer, McpServerBuilder};
pub use types::*;
