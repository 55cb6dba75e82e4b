//! HTTP transport built on axum.
//!
//! `POST <path>` carries one JSON-RPC message and answers with the reply
//! (`200`) or `202 Accepted` when there is nothing to return. Messages the
//! server sends on its own are queued and drained by `GET <path>` as a JSON
//! array.

use crate::error::{TransportError, TransportResult};
use crate::transport::{MessageHandler, Transport};
use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PATH: &str = "/mcp";

/// Default number of undrained server-initiated messages kept for `GET`.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct HttpTransport {
    bind: SocketAddr,
    path: String,
    local_addr: RwLock<Option<SocketAddr>>,
    outbox: Arc<Mutex<VecDeque<String>>>,
    outbox_capacity: usize,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

#[derive(Clone)]
struct HttpState {
    handler: Arc<dyn MessageHandler>,
    outbox: Arc<Mutex<VecDeque<String>>>,
}

impl HttpTransport {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            path: DEFAULT_PATH.to_string(),
            local_addr: RwLock::new(None),
            outbox: Arc::new(Mutex::new(VecDeque::new())),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Oldest messages are dropped once this many are waiting to be drained.
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    /// Address actually bound, available once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbox.lock().len()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> TransportResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let bound = async {
            let listener = TcpListener::bind(self.bind).await?;
            let addr = listener.local_addr()?;
            Ok::<_, std::io::Error>((listener, addr))
        }
        .await;
        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(TransportError::Bind {
                    addr: self.bind.to_string(),
                    source,
                });
            }
        };

        let state = HttpState {
            handler,
            outbox: Arc::clone(&self.outbox),
        };
        let router = Router::new()
            .route(&self.path, post(post_message).get(drain_outbox))
            .with_state(state);

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("HTTP server error: {}", e);
            }
        });

        *self.local_addr.write() = Some(addr);
        *self.shutdown.lock() = Some(tx);
        *self.task.lock() = Some(task);

        info!(addr = %addr, path = %self.path, "HTTP transport listening");
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(mut task) = task
            && tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err()
        {
            warn!("HTTP transport did not drain in time, aborting");
            task.abort();
        }

        self.outbox.lock().clear();
        *self.local_addr.write() = None;
        info!("HTTP transport stopped");
        Ok(())
    }

    async fn send(&self, message: &str) -> TransportResult<()> {
        if !self.is_running() {
            debug!("Transport not running, dropping outbound message");
            return Ok(());
        }
        let mut outbox = self.outbox.lock();
        if outbox.len() >= self.outbox_capacity {
            outbox.pop_front();
            warn!(
                capacity = self.outbox_capacity,
                "Outbox full, dropping oldest undrained message"
            );
        }
        outbox.push_back(message.to_string());
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn post_message(State(state): State<HttpState>, body: String) -> Response {
    match state.handler.handle(body).await {
        Some(reply) => ([(header::CONTENT_TYPE, "application/json")], reply).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn drain_outbox(State(state): State<HttpState>) -> Response {
    let messages = Vec::from(std::mem::take(&mut *state.outbox.lock()));
    let body = format!("[{}]", messages.join(","));
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_requests() -> Arc<dyn MessageHandler> {
        Arc::new(|message: String| async move {
            if message.contains("\"id\"") {
                Some(r#"{"ok":true}"#.to_string())
            } else {
                None
            }
        })
    }

    #[tokio::test]
    async fn test_post_and_drain() {
        let transport = HttpTransport::new("127.0.0.1:0".parse().unwrap());
        transport.start(echo_requests()).await.unwrap();
        transport.start(echo_requests()).await.unwrap();

        let addr = transport.local_addr().unwrap();
        let url = format!("http://{addr}/mcp");
        let client = reqwest::Client::new();

        let resp = client.post(&url).body(r#"{"id":1}"#).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), r#"{"ok":true}"#);

        let resp = client.post(&url).body("{}").send().await.unwrap();
        assert_eq!(resp.status(), 202);

        transport.send(r#"{"n":1}"#).await.unwrap();
        transport.send(r#"{"n":2}"#).await.unwrap();
        let body: serde_json::Value = client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(body, json!([{"n": 1}, {"n": 2}]));
        assert_eq!(transport.pending_outbound(), 0);

        transport.stop().await.unwrap();
        transport.stop().await.unwrap();
        assert!(!transport.is_running());
        assert!(transport.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_outbox_drops_oldest_when_full() {
        let transport =
            HttpTransport::new("127.0.0.1:0".parse().unwrap()).with_outbox_capacity(2);
        transport.start(echo_requests()).await.unwrap();

        for n in 1..=3 {
            transport.send(&format!(r#"{{"n":{n}}}"#)).await.unwrap();
        }
        assert_eq!(transport.pending_outbound(), 2);

        let url = format!("http://{}/mcp", transport.local_addr().unwrap());
        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body, json!([{"n": 2}, {"n": 3}]));

        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_when_stopped_is_noop() {
        let transport = HttpTransport::new("127.0.0.1:0".parse().unwrap());
        transport.send("x").await.unwrap();
        assert_eq!(transport.pending_outbound(), 0);
    }
}
