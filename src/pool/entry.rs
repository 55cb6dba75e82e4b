//! Per-server bookkeeping held under the pool lock.

use crate::client::McpClient;
use crate::config::PoolServerConfig;
use crate::error::PoolError;
use crate::pool::{PooledClient, SlotReservation};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

pub(crate) struct ConnectionEntry {
    pub client: Arc<McpClient>,
    pub in_use: bool,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub use_count: u64,
    pub idle_timer: Option<AbortHandle>,
    /// Bumped whenever the idle timer is armed or superseded.
    pub idle_epoch: u64,
}

impl ConnectionEntry {
    pub fn in_use(client: Arc<McpClient>) -> Self {
        let now = Instant::now();
        Self {
            client,
            in_use: true,
            created_at: now,
            last_used_at: now,
            use_count: 1,
            idle_timer: None,
            idle_epoch: 0,
        }
    }

    /// Mark in use, superseding any idle timer.
    pub fn checkout(&mut self) {
        self.cancel_idle_timer();
        self.in_use = true;
        self.use_count += 1;
        self.last_used_at = Instant::now();
    }

    pub fn cancel_idle_timer(&mut self) {
        self.idle_epoch += 1;
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

/// What a queued `acquire` is woken with.
pub(crate) enum Grant {
    Connection(PooledClient),
    /// A slot reserved on the waiter's behalf; the waiter connects itself.
    Slot(SlotReservation),
    Rejected(PoolError),
}

impl Grant {
    /// Neutralize a grant nobody accepted so dropping it has no side effects.
    pub fn disarm(self) {
        match self {
            Self::Connection(mut pooled) => pooled.disarm(),
            Self::Slot(mut reservation) => reservation.disarm(),
            Self::Rejected(_) => {}
        }
    }
}

pub(crate) struct Waiter {
    pub id: u64,
    pub tx: oneshot::Sender<Grant>,
}

/// Offer a grant to the oldest waiter still listening. Returns it if nobody took it.
pub(crate) fn offer(waiters: &mut VecDeque<Waiter>, mut grant: Grant) -> Option<Grant> {
    while let Some(waiter) = waiters.pop_front() {
        match waiter.tx.send(grant) {
            Ok(()) => return None,
            Err(returned) => grant = returned,
        }
    }
    Some(grant)
}

pub(crate) struct ServerPool {
    pub config: PoolServerConfig,
    /// Distinguishes this registration from a later one under the same id.
    pub generation: u64,
    pub max_connections: usize,
    pub min_connections: usize,
    pub connections: HashMap<Uuid, ConnectionEntry>,
    /// Slots reserved for connects still in flight.
    pub connecting: usize,
    pub waiters: VecDeque<Waiter>,
}

impl ServerPool {
    pub fn new(config: PoolServerConfig, generation: u64, default_max: usize) -> Self {
        let max_connections = config.max_connections.unwrap_or(default_max).max(1);
        let min_connections = config.min_connections.unwrap_or(0).min(max_connections);
        Self {
            config,
            generation,
            max_connections,
            min_connections,
            connections: HashMap::new(),
            connecting: 0,
            waiters: VecDeque::new(),
        }
    }

    /// Live plus reserved connections.
    pub fn committed(&self) -> usize {
        self.connections.len() + self.connecting
    }

    pub fn has_capacity(&self) -> bool {
        self.committed() < self.max_connections
    }

    /// The most recently used idle connection, checked out.
    pub fn checkout_idle(&mut self) -> Option<(Uuid, Arc<McpClient>)> {
        let (id, entry) = self
            .connections
            .iter_mut()
            .filter(|(_, entry)| !entry.in_use)
            .max_by_key(|(_, entry)| entry.last_used_at)?;
        entry.checkout();
        Some((*id, Arc::clone(&entry.client)))
    }

    pub fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Queued waiters whose acquire has not been cancelled.
    pub fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| !w.tx.is_closed()).count()
    }

    pub fn idle_count(&self) -> usize {
        self.connections.values().filter(|e| !e.in_use).count()
    }

    /// Abort timers and hand back every client for closing.
    pub fn drain_clients(&mut self) -> Vec<Arc<McpClient>> {
        self.connections
            .drain()
            .map(|(_, mut entry)| {
                entry.cancel_idle_timer();
                entry.client
            })
            .collect()
    }

    /// Reject every queued waiter with `error`.
    pub fn reject_waiters(&mut self, error: impl Fn() -> PoolError) {
        for waiter in self.waiters.drain(..) {
            // A waiter that already gave up has nothing to reject.
            let _ = waiter.tx.send(Grant::Rejected(error()));
        }
    }
}
