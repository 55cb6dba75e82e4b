//! Client-side channels to an MCP server.

use crate::error::{ClientError, ClientResult, TransportError};
use crate::protocol::codec;
use crate::protocol::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message, RequestId};
use crate::transport::{LineBuffer, MessageHandler};
use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Request/response channel used by [`McpClient`](super::McpClient).
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Send a request and wait for the matching response.
    async fn request(&self, request: JsonRpcRequest) -> ClientResult<JsonRpcResponse>;

    async fn notify(&self, notification: JsonRpcNotification) -> ClientResult<()>;

    /// Release the channel. Idempotent.
    async fn close(&self) -> ClientResult<()>;
}

/// JSON-RPC over HTTP POST.
pub struct HttpClientTransport {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpClientTransport {
    pub fn new(endpoint: impl Into<String>) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(TransportError::from)?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }

    async fn post(&self, body: String) -> ClientResult<reqwest::Response> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(TransportError::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!("unexpected status {status}")).into());
        }
        Ok(response)
    }
}

#[async_trait]
impl ClientTransport for HttpClientTransport {
    async fn request(&self, request: JsonRpcRequest) -> ClientResult<JsonRpcResponse> {
        let body = codec::serialize(&Message::Request(request));
        let text = self
            .post(body)
            .await?
            .text()
            .await
            .map_err(TransportError::from)?;
        Ok(codec::parse_response(&text)?)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> ClientResult<()> {
        self.post(codec::serialize(&Message::Notification(notification)))
            .await?;
        Ok(())
    }

    async fn close(&self) -> ClientResult<()> {
        Ok(())
    }
}

type Pending = Arc<DashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>;

/// Child process speaking newline-delimited JSON-RPC on stdin/stdout.
pub struct ProcessClientTransport {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: Pending,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl ProcessClientTransport {
    pub fn spawn(command: &str, args: &[String]) -> ClientResult<Self> {
        debug!("Spawning '{}' with args {:?}", command, args);
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Process(format!("failed to spawn {command}: {e}")))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TransportError::Process("child stdio not captured".into()).into());
        };

        let pending: Pending = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_responses(
            stdout,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        info!(pid = ?child.id(), "Spawned MCP server process");
        Ok(Self {
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending,
            reader: parking_lot::Mutex::new(Some(reader)),
            closed,
        })
    }

    /// Requests written but not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    async fn write_line(&self, line: &str) -> ClientResult<()> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(TransportError::Closed)?;
        trace!("Sending line: {}", line);
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(TransportError::from)?;
        stdin.write_all(b"\n").await.map_err(TransportError::from)?;
        stdin.flush().await.map_err(TransportError::from)?;
        Ok(())
    }
}

#[async_trait]
impl ClientTransport for ProcessClientTransport {
    async fn request(&self, request: JsonRpcRequest) -> ClientResult<JsonRpcResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed.into());
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request.id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: request.id.clone(),
        };

        self.write_line(&codec::serialize(&Message::Request(request)))
            .await?;

        // The sender is dropped when the process output ends.
        rx.await.map_err(|_| ClientError::Transport(TransportError::Closed))
    }

    async fn notify(&self, notification: JsonRpcNotification) -> ClientResult<()> {
        self.write_line(&codec::serialize(&Message::Notification(notification)))
            .await
    }

    async fn close(&self) -> ClientResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Closing stdin lets a well-behaved server exit on end of input.
        self.stdin.lock().await.take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.pending.clear();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child
            && let Err(e) = child.kill().await
        {
            warn!("Failed to kill MCP server process: {}", e);
        }
        debug!("Process transport closed");
        Ok(())
    }
}

/// Drops the pending entry when a request finishes, fails or is cancelled.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

async fn read_responses(mut stdout: ChildStdout, pending: Pending, closed: Arc<AtomicBool>) {
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0u8; 8 * 1024];

    loop {
        let (lines, eof) = match stdout.read(&mut chunk).await {
            Ok(0) => (buffer.finish().into_iter().collect::<Vec<_>>(), true),
            Ok(n) => (buffer.push(&chunk[..n]), false),
            Err(e) => {
                warn!("Error reading server output: {}", e);
                break;
            }
        };
        for line in lines {
            match codec::parse_response(&line) {
                Ok(response) => match pending.remove(&response.id) {
                    Some((_, tx)) => {
                        let _ = tx.send(response);
                    }
                    None => debug!("Response for unknown request {}", response.id),
                },
                Err(_) => debug!("Ignoring server message: {}", line),
            }
        }
        if eof {
            break;
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every request still in flight.
    pending.clear();
    debug!("Server output closed");
}

/// Direct calls into an in-process server, through the full wire codec.
pub struct InProcessClientTransport {
    server: Arc<dyn MessageHandler>,
    closed: AtomicBool,
}

impl InProcessClientTransport {
    pub fn new(server: Arc<dyn MessageHandler>) -> Self {
        Self {
            server,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientTransport for InProcessClientTransport {
    async fn request(&self, request: JsonRpcRequest) -> ClientResult<JsonRpcResponse> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        let reply = self
            .server
            .handle(codec::serialize(&Message::Request(request)))
            .await
            .ok_or_else(|| ClientError::MalformedResponse("no response to request".into()))?;
        Ok(codec::parse_response(&reply)?)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> ClientResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        self.server
            .handle(codec::serialize(&Message::Notification(notification)))
            .await;
        Ok(())
    }

    async fn close(&self) -> ClientResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
