//! Turning a server URI into a client transport.

use crate::client::transport::{
    ClientTransport, HttpClientTransport, InProcessClientTransport, ProcessClientTransport,
};
use crate::error::{ClientError, ClientResult};
use crate::transport::MessageHandler;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, uri: &str) -> ClientResult<Arc<dyn ClientTransport>>;
}

/// Where a server URI points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `http://` or `https://` URL, used verbatim.
    Http(String),
    /// `stdio:<command> [args..]`, split on whitespace.
    Stdio { command: String, args: Vec<String> },
}

impl Endpoint {
    pub fn parse(uri: &str) -> ClientResult<Self> {
        let uri = uri.trim();
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(Self::Http(uri.to_string()));
        }

        if let Some(rest) = uri.strip_prefix("stdio:") {
            let mut parts = rest.split_whitespace().map(String::from);
            let Some(command) = parts.next() else {
                return Err(ClientError::InvalidUri(uri.to_string()));
            };
            return Ok(Self::Stdio {
                command,
                args: parts.collect(),
            });
        }

        Err(ClientError::InvalidUri(uri.to_string()))
    }
}

/// Opens HTTP and child-process transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(&self, uri: &str) -> ClientResult<Arc<dyn ClientTransport>> {
        match Endpoint::parse(uri)? {
            Endpoint::Http(url) => {
                debug!("Opening HTTP transport to {}", url);
                Ok(Arc::new(HttpClientTransport::new(url)?))
            }
            Endpoint::Stdio { command, args } => {
                Ok(Arc::new(ProcessClientTransport::spawn(&command, &args)?))
            }
        }
    }
}

/// Connects every URI to the same in-process server.
pub struct InProcessConnector {
    server: Arc<dyn MessageHandler>,
    opened: AtomicUsize,
}

impl InProcessConnector {
    pub fn new(server: Arc<dyn MessageHandler>) -> Self {
        Self {
            server,
            opened: AtomicUsize::new(0),
        }
    }

    /// Number of transports opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn open(&self, uri: &str) -> ClientResult<Arc<dyn ClientTransport>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        debug!("Opening in-process transport for {}", uri);
        Ok(Arc::new(InProcessClientTransport::new(Arc::clone(
            &self.server,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            Endpoint::parse("http://localhost:8080/mcp").unwrap(),
            Endpoint::Http("http://localhost:8080/mcp".into())
        );
        assert_eq!(
            Endpoint::parse("stdio:node server.js --quiet").unwrap(),
            Endpoint::Stdio {
                command: "node".into(),
                args: vec!["server.js".into(), "--quiet".into()],
            }
        );
        assert!(matches!(
            Endpoint::parse("stdio:   "),
            Err(ClientError::InvalidUri(_))
        ));
        assert!(matches!(
            Endpoint::parse("ftp://example.com"),
            Err(ClientError::InvalidUri(_))
        ));
    }

    #[tokio::test]
    async fn test_default_connector_rejects_unknown_scheme() {
        assert!(DefaultConnector.open("gopher://x").await.is_err());
    }
}
