//! Runtime for the Model Context Protocol (MCP).
//!
//! Provides the JSON-RPC 2.0 codec, server transports (stdio, HTTP,
//! WebSocket), a session-aware request dispatcher, an outbound client and a
//! bounded connection pool over clients.
//!
//! # Example
//!
//! ```no_run
//! use open_agents_mcp::{
//!     config::ServerConfig,
//!     protocol::McpServerBuilder,
//!     transport::StdioTransport,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::builder().name("my-agent").build()?;
//!
//!     let server = Arc::new(
//!         McpServerBuilder::new()
//!             .config(config)
//!             .with_builtins()
//!             .build()?,
//!     );
//!
//!     let transport = Arc::new(StdioTransport::new());
//!     server.serve(transport.clone()).await?;
//!
//!     // Runs until stdin closes
//!     transport.wait().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod hooks;
pub mod pool;
pub mod protocol;
pub mod security;
pub mod server;
pub mod tools;
pub mod transport;

pub use client::{ClientState, Connector, McpClient};
pub use config::{ConnectOptions, PoolConfig, PoolServerConfig, ServerConfig};
pub use error::{McpError, Result};
pub use events::{EventEmitter, ServerEvent};
pub use hooks::{Hook, HookPipeline};
pub use pool::{ConnectionPool, PoolStats, PooledClient};
pub use protocol::{McpServer, McpServerBuilder};
pub use server::{McpHandler, ServerState, ServerStateBuilder};
pub use transport::{HttpTransport, StdioTransport, Transport, WebSocketTransport};
