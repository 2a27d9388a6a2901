//! Shard actors owning disjoint subsets of connections
//!
//! Each shard is a single-threaded actor: its run loop is the only code that
//! ever touches its connection list, so no locking is needed. All external
//! interaction goes through five inbound message channels (register,
//! unregister, broadcast, invalidate-user, stop), processed one message at a
//! time. The hard invariant lives in the broadcast path: a slow or dead
//! consumer evicts itself and never stalls delivery to the other connections
//! in the shard, nor to any other shard.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::event::{Event, UserId};
use crate::hub::interfaces::{SharedAuthorizer, SharedPresenceListener};
use crate::HubConfig;

/// Diagnostic identity of one shard-loop run, assigned at spawn time.
///
/// The generation counts restarts, so log lines from before and after a
/// crash are distinguishable. Never used for correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTag {
    /// Shard index
    pub shard: usize,
    /// Run generation, starting at 1 and bumped on every restart
    pub generation: u64,
}

impl fmt::Display for WorkerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}/run-{}", self.shard, self.generation)
    }
}

/// Why a shard loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitReason {
    /// An explicit Stop message was processed; terminal
    Stopped,
    /// Every channel sender is gone (the registry was dropped)
    Detached,
}

/// Sender-side handle to one shard's inbound channels
#[derive(Clone)]
pub(crate) struct ShardHandle {
    pub index: usize,
    pub register_tx: mpsc::Sender<Arc<Connection>>,
    pub unregister_tx: mpsc::Sender<Arc<Connection>>,
    pub broadcast_tx: mpsc::Sender<Arc<Event>>,
    pub invalidate_tx: mpsc::Sender<UserId>,
    pub stop_tx: mpsc::Sender<()>,
    pub generation: Arc<AtomicU64>,
}

impl ShardHandle {
    /// Current depth and capacity of the broadcast channel
    pub fn broadcast_backlog(&self) -> (usize, usize) {
        let capacity = self.broadcast_tx.max_capacity();
        let depth = capacity - self.broadcast_tx.capacity();
        (depth, capacity)
    }

    /// Current worker identity tag for diagnostics
    pub fn worker_tag(&self) -> WorkerTag {
        WorkerTag {
            shard: self.index,
            generation: self.generation.load(Ordering::SeqCst),
        }
    }
}

/// Receiver-side state: the connection list and the five inbound channels.
///
/// Owned by the shard's supervisor task; mutated only from `run`.
pub(crate) struct ShardState {
    index: usize,
    connections: Vec<Arc<Connection>>,
    register_rx: mpsc::Receiver<Arc<Connection>>,
    unregister_rx: mpsc::Receiver<Arc<Connection>>,
    broadcast_rx: mpsc::Receiver<Arc<Event>>,
    invalidate_rx: mpsc::Receiver<UserId>,
    stop_rx: mpsc::Receiver<()>,
    authorizer: SharedAuthorizer,
    presence: Option<SharedPresenceListener>,
    total_connections: Arc<AtomicI64>,
    explicit_stop: bool,
}

/// One inbound message, pulled off whichever channel had it
enum LoopMsg {
    Register(Arc<Connection>),
    Unregister(Arc<Connection>),
    Broadcast(Arc<Event>),
    InvalidateUser(UserId),
    Stop,
    Detached,
}

/// Build one shard: the external handle and the loop-owned state
pub(crate) fn shard_pair(
    index: usize,
    config: &HubConfig,
    authorizer: SharedAuthorizer,
    presence: Option<SharedPresenceListener>,
    total_connections: Arc<AtomicI64>,
) -> (ShardHandle, ShardState) {
    let (register_tx, register_rx) = mpsc::channel(1);
    let (unregister_tx, unregister_rx) = mpsc::channel(1);
    let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_queue_size);
    let (invalidate_tx, invalidate_rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = mpsc::channel(1);

    let handle = ShardHandle {
        index,
        register_tx,
        unregister_tx,
        broadcast_tx,
        invalidate_tx,
        stop_tx,
        generation: Arc::new(AtomicU64::new(0)),
    };

    let state = ShardState {
        index,
        connections: Vec::new(),
        register_rx,
        unregister_rx,
        broadcast_rx,
        invalidate_rx,
        stop_rx,
        authorizer,
        presence,
        total_connections,
        explicit_stop: false,
    };

    (handle, state)
}

impl ShardState {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn explicit_stop(&self) -> bool {
        self.explicit_stop
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run the shard loop until an explicit Stop or until detached.
    ///
    /// Exactly one message is processed at a time, in arrival order per
    /// channel. The loop is the sole mutator of the connection list.
    pub(crate) async fn run(&mut self) -> ExitReason {
        loop {
            let msg = tokio::select! {
                Some(connection) = self.register_rx.recv() => LoopMsg::Register(connection),
                Some(connection) = self.unregister_rx.recv() => LoopMsg::Unregister(connection),
                Some(event) = self.broadcast_rx.recv() => LoopMsg::Broadcast(event),
                Some(user_id) = self.invalidate_rx.recv() => LoopMsg::InvalidateUser(user_id),
                stop = self.stop_rx.recv() => match stop {
                    Some(()) => LoopMsg::Stop,
                    None => LoopMsg::Detached,
                },
            };

            match msg {
                LoopMsg::Register(connection) => self.handle_register(connection),
                LoopMsg::Unregister(connection) => self.handle_unregister(&connection),
                LoopMsg::Broadcast(event) => self.handle_broadcast(&event),
                LoopMsg::InvalidateUser(user_id) => self.handle_invalidate(&user_id),
                LoopMsg::Stop => {
                    self.handle_stop();
                    return ExitReason::Stopped;
                }
                LoopMsg::Detached => return ExitReason::Detached,
            }
        }
    }

    fn handle_register(&mut self, connection: Arc<Connection>) {
        // Invariant: a connection appears at most once in the list.
        if self
            .connections
            .iter()
            .any(|candidate| candidate.id() == connection.id())
        {
            debug!(
                "shard {}: connection {} already registered",
                self.index,
                connection.id()
            );
            return;
        }

        self.connections.push(connection);
        self.total_connections.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_unregister(&mut self, connection: &Arc<Connection>) {
        let user_id = connection.user_id();

        // Single pass: find the departing connection and check whether any
        // other connection still belongs to the same user.
        let mut index_to_del = None;
        let mut user_still_connected = false;
        for (i, candidate) in self.connections.iter().enumerate() {
            if candidate.id() == connection.id() {
                index_to_del = Some(i);
                continue;
            }
            if candidate.user_id() == user_id {
                user_still_connected = true;
                if index_to_del.is_some() {
                    break;
                }
            }
        }

        if let Some(i) = index_to_del {
            self.connections.swap_remove(i);
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
        }

        if user_id.is_empty() {
            return;
        }

        // The scan runs even when the connection was not found: an eviction
        // during broadcast removes the list entry first, and the transport's
        // later unregister must still produce the offline signal.
        if !user_still_connected {
            self.notify_offline(user_id.to_string());
        }
    }

    fn handle_broadcast(&mut self, event: &Arc<Event>) {
        let mut i = 0;
        while i < self.connections.len() {
            let connection = &self.connections[i];

            if !self.authorizer.event_in_scope(connection, event) {
                i += 1;
                continue;
            }

            match connection.try_enqueue(Arc::clone(event)) {
                Ok(()) => i += 1,
                Err(reason) => {
                    // Backpressure eviction: never wait for a slow consumer.
                    warn!(
                        "shard {}: outbound queue {} for user {}, evicting connection {}",
                        self.index,
                        reason,
                        connection.user_id(),
                        connection.id()
                    );
                    connection.close();
                    self.connections.swap_remove(i);
                    self.total_connections.fetch_sub(1, Ordering::SeqCst);
                    // The swapped-in connection now sits at index i.
                }
            }
        }
    }

    fn handle_invalidate(&mut self, user_id: &str) {
        for connection in &self.connections {
            if connection.user_id() == user_id {
                connection.invalidate_cache();
            }
        }
    }

    fn handle_stop(&mut self) {
        for connection in &self.connections {
            connection.close();
        }
        self.total_connections
            .fetch_sub(self.connections.len() as i64, Ordering::SeqCst);
        self.connections.clear();
        self.explicit_stop = true;
    }

    fn notify_offline(&self, user_id: UserId) {
        if let Some(presence) = &self.presence {
            let presence = Arc::clone(presence);
            tokio::spawn(async move {
                presence.user_went_offline(user_id).await;
            });
        }
    }
}
