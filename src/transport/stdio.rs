//! Stdio transport: one JSON document per line.

use crate::error::{TransportError, TransportResult};
use crate::transport::framing::LineBuffer;
use crate::transport::{MessageHandler, Transport};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Stdin, Stdout};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

const READ_CHUNK: usize = 8 * 1024;

/// Line-delimited transport over any reader/writer pair, process stdio by default.
pub struct StdioTransport<R = Stdin, W = Stdout> {
    reader: parking_lot::Mutex<Option<R>>,
    writer: Arc<Mutex<W>>,
    running: Arc<AtomicBool>,
    stopped: Arc<watch::Sender<bool>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self::with_io(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn with_io(reader: R, writer: W) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            reader: parking_lot::Mutex::new(Some(reader)),
            writer: Arc::new(Mutex::new(writer)),
            running: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(stopped),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Resolves once the transport has stopped, either through `stop` or end of input.
    pub async fn wait(&self) {
        let mut rx = self.stopped.subscribe();
        // The sender lives as long as `self`, so this only fails after drop.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> TransportResult<()> {
        let reader = {
            let mut slot = self.reader.lock();
            let reader = slot.take();
            if reader.is_some() {
                self.running.store(true, Ordering::SeqCst);
            }
            reader
        };

        let Some(reader) = reader else {
            // Input is consumed once; a stopped stdio transport cannot restart.
            return if self.is_running() {
                Ok(())
            } else {
                Err(TransportError::Closed)
            };
        };

        self.stopped.send_replace(false);
        let task = tokio::spawn(read_loop(
            reader,
            handler,
            Arc::clone(&self.writer),
            Arc::clone(&self.running),
            Arc::clone(&self.stopped),
        ));
        *self.task.lock() = Some(task);

        info!("Stdio transport started");
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        let task = self.task.lock().take();
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if let Some(task) = task {
            task.abort();
        }
        self.stopped.send_replace(true);

        if was_running {
            info!("Stdio transport stopped");
            self.writer.lock().await.flush().await?;
        }
        Ok(())
    }

    async fn send(&self, message: &str) -> TransportResult<()> {
        if !self.is_running() {
            debug!("Transport not running, dropping outbound message");
            return Ok(());
        }
        write_line(&self.writer, message).await?;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn read_loop<R, W>(
    mut reader: R,
    handler: Arc<dyn MessageHandler>,
    writer: Arc<Mutex<W>>,
    running: Arc<AtomicBool>,
    stopped: Arc<watch::Sender<bool>>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let _guard = StopGuard { running, stopped };
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    'read: loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!("End of input");
                if let Some(line) = buffer.finish() {
                    deliver(handler.as_ref(), &writer, line).await;
                }
                break;
            }
            Ok(n) => {
                for line in buffer.push(&chunk[..n]) {
                    if !deliver(handler.as_ref(), &writer, line).await {
                        break 'read;
                    }
                }
            }
            Err(e) => {
                error!("Error reading input: {}", e);
                break;
            }
        }
    }
}

/// Marks the transport stopped however the read task ends, abort included.
struct StopGuard {
    running: Arc<AtomicBool>,
    stopped: Arc<watch::Sender<bool>>,
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Stdio transport stopped");
        }
        self.stopped.send_replace(true);
    }
}

/// Hand one line to the handler and write any reply. `false` once the output is gone.
async fn deliver<W: AsyncWrite + Unpin>(
    handler: &dyn MessageHandler,
    writer: &Mutex<W>,
    line: String,
) -> bool {
    trace!("Received line: {}", line);
    let reply = match AssertUnwindSafe(handler.handle(line)).catch_unwind().await {
        Ok(reply) => reply,
        Err(_) => {
            error!("Message handler panicked, dropping message");
            return true;
        }
    };
    let Some(reply) = reply else {
        return true;
    };
    match write_line(writer, &reply).await {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to write response: {}", e);
            false
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &Mutex<W>, content: &str) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    trace!("Sending line: {}", content);
    writer.write_all(content.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
