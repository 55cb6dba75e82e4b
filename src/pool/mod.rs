//! Bounded pool of [`McpClient`] connections, keyed by upstream server.
//!
//! Each registered server gets at most `max_connections` live clients.
//! `acquire` reuses an idle client, opens a new one while under the ceiling,
//! or queues behind earlier callers until one is released. Released clients
//! sit idle until `idle_timeout` and are then closed, never dropping a server
//! below its `min_connections`.
//!
//! All bookkeeping lives behind a single mutex that is never held across an
//! `.await`. A connect in flight holds a reserved slot, so the ceiling counts
//! it before it finishes.
//!
//! ```no_run
//! use open_agents_mcp::config::{PoolConfig, PoolServerConfig};
//! use open_agents_mcp::pool::ConnectionPool;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ConnectionPool::new(PoolConfig::default());
//! pool.register_server(PoolServerConfig::new("search", "http://localhost:8080/mcp"))?;
//!
//! let tools = pool
//!     .with_connection("search", |client| async move { client.list_tools().await })
//!     .await??;
//! println!("{} tools", tools.len());
//! # Ok(())
//! # }
//! ```

mod entry;
pub mod metrics;

pub use metrics::{PoolMetrics, PoolMetricsSnapshot};

use crate::client::{Connector, DefaultConnector, McpClient};
use crate::config::{PoolConfig, PoolServerConfig};
use crate::error::{ClientResult, PoolError, PoolResult};
use crate::protocol::types::ServerInfo;
use entry::{ConnectionEntry, Grant, ServerPool, Waiter, offer};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Default)]
struct PoolState {
    closed: bool,
    servers: HashMap<String, ServerPool>,
    next_generation: u64,
    next_waiter: u64,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    metrics: PoolMetrics,
}

/// Connection counts for one server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub connecting: usize,
    pub waiting: usize,
}

/// Point-in-time view of the whole pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub connecting: usize,
    pub waiting: usize,
    pub servers: BTreeMap<String, ServerStats>,
}

/// Shared handle to a connection pool. Clones refer to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Pool that opens HTTP and child-process connections.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_connector(config, Arc::new(DefaultConnector))
    }

    pub fn with_connector(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                state: Mutex::new(PoolState::default()),
                metrics: PoolMetrics::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Register an upstream server. Registering an existing id keeps the
    /// original configuration.
    pub fn register_server(&self, config: PoolServerConfig) -> PoolResult<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(PoolError::PoolClosed);
        }
        if state.servers.contains_key(&config.id) {
            debug!(server_id = %config.id, "Server already registered");
            return Ok(());
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        info!(server_id = %config.id, uri = %config.uri, "Registered server");
        let server = ServerPool::new(config, generation, self.inner.config.max_connections);
        state.servers.insert(server.config.id.clone(), server);
        Ok(())
    }

    /// Forget a server, reject its waiters and close its connections.
    /// Returns false if it was not registered.
    pub async fn unregister_server(&self, server_id: &str) -> bool {
        let removed = self.inner.state.lock().servers.remove(server_id);
        let Some(mut server) = removed else {
            return false;
        };

        server.reject_waiters(|| PoolError::ServerUnregistered(server_id.to_string()));
        let clients = server.drain_clients();
        info!(server_id, connections = clients.len(), "Unregistered server");
        self.close_clients(clients).await;
        true
    }

    /// Check out a connection to `server_id`.
    #[instrument(skip(self))]
    pub async fn acquire(&self, server_id: &str) -> PoolResult<PooledClient> {
        let plan = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            state.next_waiter += 1;
            let waiter_id = state.next_waiter;
            let Some(server) = state.servers.get_mut(server_id) else {
                return Err(PoolError::ServerNotRegistered(server_id.to_string()));
            };

            if let Some((id, client)) = server.checkout_idle() {
                self.inner.metrics.record_acquisition();
                Acquire::Reused(PooledClient::new(&self.inner, server_id, id, client))
            } else if server.has_capacity() {
                Acquire::Connect(self.inner.reserve(server_id, server))
            } else {
                let (tx, rx) = oneshot::channel();
                server.waiters.push_back(Waiter { id: waiter_id, tx });
                Acquire::Wait(waiter_id, rx)
            }
        };

        match plan {
            Acquire::Reused(pooled) => {
                debug!(id = %pooled.id(), "Reusing idle connection");
                Ok(pooled)
            }
            Acquire::Connect(reservation) => self.connect(reservation).await,
            Acquire::Wait(waiter_id, rx) => self.wait(server_id, waiter_id, rx).await,
        }
    }

    async fn connect(&self, mut reservation: SlotReservation) -> PoolResult<PooledClient> {
        let client = Arc::new(McpClient::new(Arc::clone(&self.inner.connector)));
        let connected = client
            .connect(
                &reservation.config.uri,
                reservation.config.connect_options.clone(),
            )
            .await;
        // From here the outcome is settled under the lock.
        reservation.disarm();

        match self.inner.finish_connect(
            &reservation.server_id,
            reservation.generation,
            &client,
            connected,
        ) {
            Connected::Ready(pooled) => {
                info!(server_id = %pooled.server_id(), id = %pooled.id(), "Opened pooled connection");
                Ok(pooled)
            }
            Connected::Failed(error) => {
                warn!("{}", error);
                Err(error)
            }
            Connected::Gone(error) => {
                client.disconnect().await;
                Err(error)
            }
        }
    }

    async fn wait(
        &self,
        server_id: &str,
        waiter_id: u64,
        mut rx: oneshot::Receiver<Grant>,
    ) -> PoolResult<PooledClient> {
        let timeout = self.inner.config.acquire_timeout;
        debug!("At capacity, waiting for a connection");

        let grant = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(_)) => return Err(PoolError::PoolClosed),
            Err(_) => {
                let removed = self
                    .inner
                    .state
                    .lock()
                    .servers
                    .get_mut(server_id)
                    .is_some_and(|server| server.remove_waiter(waiter_id));

                let timed_out = PoolError::AcquireTimeout {
                    server_id: server_id.to_string(),
                    timeout,
                };
                if removed {
                    self.inner.metrics.record_acquire_timeout();
                    warn!(?timeout, "Timed out waiting for a connection");
                    return Err(timed_out);
                }
                // Already dequeued, so a grant was sent before the lock was taken.
                match rx.try_recv() {
                    Ok(grant) => grant,
                    Err(_) => return Err(timed_out),
                }
            }
        };

        match grant {
            Grant::Connection(pooled) => Ok(pooled),
            Grant::Slot(reservation) => self.connect(reservation).await,
            Grant::Rejected(error) => Err(error),
        }
    }

    /// Return a connection to the pool.
    pub async fn release(&self, mut pooled: PooledClient) {
        if !std::ptr::eq(pooled.pool.as_ptr(), Arc::as_ptr(&self.inner)) {
            warn!(id = %pooled.id, "Released a connection owned by another pool");
            return;
        }
        pooled.disarm();
        if let Some(client) = self.inner.checkin(&pooled.server_id, pooled.id) {
            client.disconnect().await;
        }
    }

    /// Run `f` with a connection, releasing it afterwards whatever `f` returns.
    pub async fn with_connection<F, Fut, T>(&self, server_id: &str, f: F) -> PoolResult<T>
    where
        F: FnOnce(Arc<McpClient>) -> Fut,
        Fut: Future<Output = T>,
    {
        let pooled = self.acquire(server_id).await?;
        let output = f(Arc::clone(pooled.client())).await;
        self.release(pooled).await;
        Ok(output)
    }

    /// Open connections until the server has `min_connections`. Returns how
    /// many were opened; individual failures are logged.
    #[instrument(skip(self))]
    pub async fn warm_up(&self, server_id: &str) -> PoolResult<usize> {
        let reservations = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            let Some(server) = state.servers.get_mut(server_id) else {
                return Err(PoolError::ServerNotRegistered(server_id.to_string()));
            };
            let missing = server.min_connections.saturating_sub(server.committed());
            (0..missing)
                .map(|_| self.inner.reserve(server_id, server))
                .collect::<Vec<_>>()
        };

        let results = join_all(reservations.into_iter().map(|r| self.connect(r))).await;
        let mut opened = 0;
        for result in results {
            match result {
                Ok(pooled) => {
                    opened += 1;
                    self.release(pooled).await;
                }
                Err(e) => warn!("Warm-up connection failed: {}", e),
            }
        }
        Ok(opened)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let mut stats = PoolStats::default();

        for (id, server) in &state.servers {
            let idle = server.idle_count();
            let total = server.connections.len();
            let server_stats = ServerStats {
                total,
                active: total - idle,
                idle,
                connecting: server.connecting,
                waiting: server.live_waiters(),
            };
            stats.total += server_stats.total;
            stats.active += server_stats.active;
            stats.idle += server_stats.idle;
            stats.connecting += server_stats.connecting;
            stats.waiting += server_stats.waiting;
            stats.servers.insert(id.clone(), server_stats);
        }
        stats
    }

    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Reject all waiters and close every connection. Later acquires fail
    /// with [`PoolError::PoolClosed`].
    pub async fn close(&self) {
        let servers = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            std::mem::take(&mut state.servers)
        };

        let mut clients = Vec::new();
        for (_, mut server) in servers {
            server.reject_waiters(|| PoolError::PoolClosed);
            clients.extend(server.drain_clients());
        }
        info!(connections = clients.len(), "Closing connection pool");
        self.close_clients(clients).await;
    }

    async fn close_clients(&self, clients: Vec<Arc<McpClient>>) {
        for _ in &clients {
            self.inner.metrics.record_connection_closed();
        }
        join_all(clients.iter().map(|client| client.disconnect())).await;
    }
}

enum Acquire {
    Reused(PooledClient),
    Connect(SlotReservation),
    Wait(u64, oneshot::Receiver<Grant>),
}

enum Connected {
    Ready(PooledClient),
    Failed(PoolError),
    /// The server or pool went away while connecting.
    Gone(PoolError),
}

impl PoolInner {
    /// Reserve a connect slot. Caller holds the lock.
    fn reserve(self: &Arc<Self>, server_id: &str, server: &mut ServerPool) -> SlotReservation {
        server.connecting += 1;
        SlotReservation {
            server_id: server_id.to_string(),
            generation: server.generation,
            config: server.config.clone(),
            pool: Arc::downgrade(self),
            armed: true,
        }
    }

    /// Hand a freed slot to the oldest waiter, who then connects. Caller holds the lock.
    fn offer_freed_slot(self: &Arc<Self>, server_id: &str, server: &mut ServerPool) {
        if server.waiters.is_empty() || !server.has_capacity() {
            return;
        }
        let reservation = self.reserve(server_id, server);
        if let Some(grant) = offer(&mut server.waiters, Grant::Slot(reservation)) {
            grant.disarm();
            server.connecting -= 1;
        }
    }

    fn release_slot(self: &Arc<Self>, server_id: &str, generation: u64) {
        let mut state = self.state.lock();
        if let Some(server) = state.servers.get_mut(server_id)
            && server.generation == generation
        {
            server.connecting = server.connecting.saturating_sub(1);
            self.offer_freed_slot(server_id, server);
        }
    }

    fn finish_connect(
        self: &Arc<Self>,
        server_id: &str,
        generation: u64,
        client: &Arc<McpClient>,
        connected: ClientResult<ServerInfo>,
    ) -> Connected {
        let mut state = self.state.lock();
        let closed = state.closed;
        let Some(server) = state
            .servers
            .get_mut(server_id)
            .filter(|server| server.generation == generation)
        else {
            return Connected::Gone(if closed {
                PoolError::PoolClosed
            } else {
                PoolError::ServerUnregistered(server_id.to_string())
            });
        };

        server.connecting = server.connecting.saturating_sub(1);
        if let Err(source) = connected {
            self.metrics.record_connection_error();
            self.offer_freed_slot(server_id, server);
            return Connected::Failed(PoolError::Connect {
                server_id: server_id.to_string(),
                source,
            });
        }

        let id = Uuid::new_v4();
        server
            .connections
            .insert(id, ConnectionEntry::in_use(Arc::clone(client)));
        self.metrics.record_connection_created();
        self.metrics.record_acquisition();
        Connected::Ready(PooledClient::new(self, server_id, id, Arc::clone(client)))
    }

    /// Take back a checked-out connection. Returns a client the caller must close.
    fn checkin(self: &Arc<Self>, server_id: &str, id: Uuid) -> Option<Arc<McpClient>> {
        let mut state = self.state.lock();
        // Gone if the server was unregistered or the pool closed meanwhile.
        let server = state.servers.get_mut(server_id)?;
        let entry = server.connections.get_mut(&id)?;
        if !entry.in_use {
            return None;
        }
        self.metrics.record_release();

        if !entry.client.is_ready() {
            let entry = server.connections.remove(&id)?;
            debug!(
                server_id,
                %id,
                uses = entry.use_count,
                age = ?entry.created_at.elapsed(),
                "Evicting broken connection"
            );
            self.metrics.record_connection_closed();
            self.offer_freed_slot(server_id, server);
            return Some(entry.client);
        }

        entry.last_used_at = Instant::now();
        let handoff = PooledClient::new(self, server_id, id, Arc::clone(&entry.client));
        match offer(&mut server.waiters, Grant::Connection(handoff)) {
            None => {
                entry.use_count += 1;
                self.metrics.record_acquisition();
                debug!(server_id, %id, "Handed connection to waiter");
            }
            Some(grant) => {
                grant.disarm();
                entry.in_use = false;
                self.arm_idle_timer(server_id, id, entry);
            }
        }
        None
    }

    fn arm_idle_timer(self: &Arc<Self>, server_id: &str, id: Uuid, entry: &mut ConnectionEntry) {
        entry.cancel_idle_timer();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(server_id, %id, "No runtime available, idle connection will not expire");
            return;
        };

        let epoch = entry.idle_epoch;
        let pool = Arc::downgrade(self);
        let server_id = server_id.to_string();
        let idle_timeout = self.config.idle_timeout;
        let timer = runtime.spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            let Some(inner) = pool.upgrade() else {
                return;
            };
            if let Some(client) = inner.evict_idle(&server_id, id, epoch) {
                client.disconnect().await;
            }
        });
        entry.idle_timer = Some(timer.abort_handle());
    }

    fn evict_idle(self: &Arc<Self>, server_id: &str, id: Uuid, epoch: u64) -> Option<Arc<McpClient>> {
        let mut state = self.state.lock();
        let server = state.servers.get_mut(server_id)?;
        let live = server.connections.len();
        let min = server.min_connections;

        let entry = server.connections.get_mut(&id)?;
        if entry.in_use || entry.idle_epoch != epoch {
            return None;
        }
        entry.idle_timer = None;
        if live <= min {
            debug!(server_id, %id, min, "Keeping idle connection");
            return None;
        }

        let entry = server.connections.remove(&id)?;
        debug!(server_id, %id, uses = entry.use_count, "Closing idle connection");
        self.metrics.record_connection_closed();
        self.offer_freed_slot(server_id, server);
        Some(entry.client)
    }
}

/// A checked-out connection. Give it back with [`ConnectionPool::release`];
/// dropping it returns it to the pool as well.
pub struct PooledClient {
    id: Uuid,
    server_id: String,
    client: Arc<McpClient>,
    pool: Weak<PoolInner>,
    armed: bool,
}

impl PooledClient {
    fn new(pool: &Arc<PoolInner>, server_id: &str, id: Uuid, client: Arc<McpClient>) -> Self {
        Self {
            id,
            server_id: server_id.to_string(),
            client,
            pool: Arc::downgrade(pool),
            armed: true,
        }
    }

    /// Stable id of the underlying connection.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn client(&self) -> &Arc<McpClient> {
        &self.client
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Deref for PooledClient {
    type Target = McpClient;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledClient")
            .field("id", &self.id)
            .field("server_id", &self.server_id)
            .field("state", &self.client.state())
            .finish()
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(inner) = self.pool.upgrade() else {
            return;
        };
        debug!(id = %self.id, "Pooled connection dropped without release");
        if let Some(client) = inner.checkin(&self.server_id, self.id)
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            runtime.spawn(async move { client.disconnect().await });
        }
    }
}

/// A connect slot counted against the server's ceiling. Dropping it armed
/// gives the slot back.
pub(crate) struct SlotReservation {
    server_id: String,
    generation: u64,
    config: PoolServerConfig,
    pool: Weak<PoolInner>,
    armed: bool,
}

impl SlotReservation {
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.armed
            && let Some(inner) = self.pool.upgrade()
        {
            inner.release_slot(&self.server_id, self.generation);
        }
    }
}
