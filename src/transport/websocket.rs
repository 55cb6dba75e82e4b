//! WebSocket transport built on axum's `ws` support.
//!
//! Every text frame is one message. Replies go back on the socket the
//! request came from; [`Transport::send`] broadcasts to all open sockets.

use crate::error::{TransportError, TransportResult};
use crate::transport::{MessageHandler, Transport};
use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const BROADCAST_CAPACITY: usize = 256;

pub struct WebSocketTransport {
    bind: SocketAddr,
    path: String,
    local_addr: RwLock<Option<SocketAddr>>,
    broadcast: broadcast::Sender<String>,
    closing: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    connections: Arc<AtomicUsize>,
    running: AtomicBool,
}

#[derive(Clone)]
struct WsState {
    handler: Arc<dyn MessageHandler>,
    broadcast: broadcast::Sender<String>,
    closing: watch::Receiver<bool>,
    connections: Arc<AtomicUsize>,
}

impl WebSocketTransport {
    pub fn new(bind: SocketAddr) -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            bind,
            path: super::http::DEFAULT_PATH.to_string(),
            local_addr: RwLock::new(None),
            broadcast,
            closing: Mutex::new(None),
            task: Mutex::new(None),
            connections: Arc::new(AtomicUsize::new(0)),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Number of currently open sockets.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
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

        let (closing_tx, closing_rx) = watch::channel(false);
        let state = WsState {
            handler,
            broadcast: self.broadcast.clone(),
            closing: closing_rx.clone(),
            connections: Arc::clone(&self.connections),
        };
        let router = Router::new()
            .route(&self.path, get(upgrade))
            .with_state(state);

        let mut shutdown = closing_rx;
        let task = tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown.wait_for(|closing| *closing).await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(signal)
                .await
            {
                error!("WebSocket server error: {}", e);
            }
        });

        *self.local_addr.write() = Some(addr);
        *self.closing.lock() = Some(closing_tx);
        *self.task.lock() = Some(task);

        info!(addr = %addr, path = %self.path, "WebSocket transport listening");
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        // Closes open sockets as well as the listener.
        if let Some(closing) = self.closing.lock().take() {
            let _ = closing.send(true);
        }
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!("WebSocket server task ended abnormally: {}", e);
        }

        *self.local_addr.write() = None;
        info!("WebSocket transport stopped");
        Ok(())
    }

    async fn send(&self, message: &str) -> TransportResult<()> {
        if !self.is_running() {
            debug!("Transport not running, dropping outbound message");
            return Ok(());
        }
        // No subscribers just means no socket is open.
        let _ = self.broadcast.send(message.to_string());
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let open = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    debug!(open, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
    let mut broadcast_rx = state.broadcast.subscribe();

    let writer = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(text) => text,
                    None => break,
                },
                message = broadcast_rx.recv() => match message {
                    Ok(text) => text,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket client lagging, dropped broadcasts");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut closing = state.closing.clone();
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = closing.wait_for(|closing| *closing) => break,
        };
        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                if let Some(reply) = state.handler.handle(text.as_str().to_owned()).await
                    && reply_tx.send(reply).is_err()
                {
                    break;
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("WebSocket read error: {}", e);
                break;
            }
        }
    }

    drop(reply_tx);
    writer.abort();
    let open = state.connections.fetch_sub(1, Ordering::SeqCst) - 1;
    debug!(open, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn connect(addr: SocketAddr) -> Client {
        let (socket, response) = connect_async(format!("ws://{addr}/mcp")).await.unwrap();
        assert_eq!(response.status(), 101);
        socket
    }

    async fn read_text(socket: &mut Client) -> String {
        loop {
            match socket.next().await.unwrap().unwrap() {
                ClientMessage::Text(text) => return text.to_string(),
                ClientMessage::Ping(_) | ClientMessage::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn wait_for_connections(transport: &WebSocketTransport, n: usize) {
        for _ in 0..100 {
            if transport.connections() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} connections, have {}", transport.connections());
    }

    async fn echo_transport() -> WebSocketTransport {
        let transport = WebSocketTransport::new("127.0.0.1:0".parse().unwrap());
        transport
            .start(Arc::new(|message: String| async move {
                Some(format!("re:{message}"))
            }))
            .await
            .unwrap();
        transport
    }

    #[tokio::test]
    async fn test_reply_and_broadcast() {
        let transport = echo_transport().await;
        let addr = transport.local_addr().unwrap();

        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        wait_for_connections(&transport, 2).await;

        a.send(ClientMessage::text("ping")).await.unwrap();
        assert_eq!(read_text(&mut a).await, "re:ping");

        transport.send("hello all").await.unwrap();
        assert_eq!(read_text(&mut a).await, "hello all");
        assert_eq!(read_text(&mut b).await, "hello all");

        transport.stop().await.unwrap();
        assert!(!transport.is_running());
        wait_for_connections(&transport, 0).await;
    }

    #[tokio::test]
    async fn test_large_messages() {
        let transport = echo_transport().await;
        let mut socket = connect(transport.local_addr().unwrap()).await;

        // 16-bit and 64-bit extended payload lengths.
        for len in [200, 70_000] {
            let message = "x".repeat(len);
            socket.send(ClientMessage::text(message.clone())).await.unwrap();
            assert_eq!(read_text(&mut socket).await, format!("re:{message}"));
        }

        socket.close(None).await.unwrap();
        wait_for_connections(&transport, 0).await;
        transport.stop().await.unwrap();
    }
}
