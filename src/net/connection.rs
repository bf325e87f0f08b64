//! Connection registry and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Keep an id-indexed registry of live connections for bulk shutdown
//! - Deliver graceful and forced close signals to each connection
//!
//! # Design Decisions
//! - Registry entries are removed by a guard's `Drop`, so an entry never
//!   outlives its connection task, however the task ends
//! - The guard is shared (`Arc`) between a connection task and any tunnel
//!   task spawned from it

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::observability::metrics;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Close request delivered to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CloseSignal {
    Open,
    /// Finish the in-flight exchange, then close.
    Graceful,
    /// Close now.
    Force,
}

#[derive(Debug)]
struct ConnectionHandle {
    peer_addr: SocketAddr,
    accepted_at: Instant,
    close_tx: watch::Sender<CloseSignal>,
    tasks: Vec<AbortHandle>,
}

/// Live connections, indexed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a newly accepted connection.
    pub fn register(self: &Arc<Self>, peer_addr: SocketAddr) -> (Arc<ConnectionGuard>, watch::Receiver<CloseSignal>) {
        let id = ConnectionId::new();
        let (close_tx, close_rx) = watch::channel(CloseSignal::Open);
        self.connections.insert(
            id,
            ConnectionHandle {
                peer_addr,
                accepted_at: Instant::now(),
                close_tx,
                tasks: Vec::new(),
            },
        );
        metrics::record_connection_opened();

        let guard = Arc::new(ConnectionGuard {
            registry: Arc::clone(self),
            id,
        });
        (guard, close_rx)
    }

    /// Attach a task to a connection so a forced close can abort it.
    /// No-op if the connection is already gone.
    pub fn attach_task(&self, id: ConnectionId, task: AbortHandle) {
        match self.connections.get_mut(&id) {
            Some(mut handle) => handle.tasks.push(task),
            None => task.abort(),
        }
    }

    /// A receiver for the connection's close signal.
    pub fn close_signal(&self, id: ConnectionId) -> Option<watch::Receiver<CloseSignal>> {
        self.connections.get(&id).map(|h| h.close_tx.subscribe())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Deliver `signal` to every live connection.
    pub fn signal_all(&self, signal: CloseSignal) {
        for handle in self.connections.iter() {
            handle.close_tx.send_replace(signal);
        }
    }

    /// Abort every task attached to a live connection. Returns how many
    /// connections were still registered.
    pub fn abort_all(&self) -> usize {
        let mut remaining = 0;
        for handle in self.connections.iter() {
            remaining += 1;
            tracing::warn!(
                peer_addr = %handle.peer_addr,
                age_ms = handle.accepted_at.elapsed().as_millis() as u64,
                "Force-closing connection"
            );
            for task in &handle.tasks {
                task.abort();
            }
        }
        remaining
    }

    /// Wait until every connection has deregistered, or `grace` elapses.
    /// Returns whether the registry drained.
    pub async fn wait_until_empty(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        while !self.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }

    fn remove(&self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            metrics::record_connection_closed();
        }
    }
}

/// Keeps a connection registered. The entry is removed when the last clone drops.
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        tracing::trace!(connection_id = %self.id, "Connection deregistered");
    }
}
