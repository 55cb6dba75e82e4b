//! Byte-channel abstraction carrying serialized protocol messages.
//!
//! A [`Transport`] only moves text. Whatever sits behind the
//! [`MessageHandler`] decides what each message means and whether it is
//! answered.

pub mod framing;
pub mod http;
pub mod stdio;
pub mod websocket;

pub use framing::LineBuffer;
pub use http::HttpTransport;
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

use crate::error::TransportResult;
use async_trait::async_trait;
use std::sync::Arc;

/// Receives inbound messages from a transport.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message. `Some` is written back on the channel it arrived on.
    async fn handle(&self, message: String) -> Option<String>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    async fn handle(&self, message: String) -> Option<String> {
        self(message).await
    }
}

/// Transport lifecycle and outbound traffic.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin listening. Calling it on a running transport is a no-op.
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> TransportResult<()>;

    /// Stop listening and release channel resources. Idempotent.
    async fn stop(&self) -> TransportResult<()>;

    /// Send a server-initiated message. A no-op when not running.
    async fn send(&self, message: &str) -> TransportResult<()>;

    fn is_running(&self) -> bool;
}
