//! Sharded real-time event distribution hub
//!
//! This library delivers application events (new/edited/deleted messages,
//! presence changes, cache-invalidation signals) to every live client
//! connection of the right users, without letting a single slow consumer
//! stall anything else. Connections are partitioned across N single-threaded
//! shard actors by a stable hash of the owning user id; each shard loop is
//! the sole owner of its connection list, so no locking is involved. A
//! supervisor restarts crashed shard loops, and a watchdog flags shards whose
//! broadcast channel is backing up.

pub mod connection;
pub mod error;
pub mod event;
pub mod hub;

pub use connection::{Connection, EnqueueError, EventReceiver};
pub use error::{HubError, Result};
pub use event::{Event, EventKind, EventScope};
pub use hub::{
    Authorizer, ClusterGateway, HubBuilder, HubRegistry, MetricsSink, PresenceListener,
    StaticMembership, WorkerTag,
};

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a unique connection ID
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Hub configuration
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Number of shards, fixed for the process lifetime
    pub shard_count: usize,
    /// Capacity of each connection's outbound event queue
    pub send_queue_size: usize,
    /// Capacity of each shard's inbound broadcast channel
    pub broadcast_queue_size: usize,
    /// How often the deadlock watchdog samples shard backlogs
    pub watchdog_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            send_queue_size: 256,
            broadcast_queue_size: 4096,
            watchdog_interval: Duration::from_secs(15),
        }
    }
}

impl HubConfig {
    /// Broadcast backlog depth at which the watchdog raises its warning
    pub fn broadcast_high_water(&self) -> usize {
        (self.broadcast_queue_size * 99) / 100
    }
}

/// Default shard count: twice the available parallelism
pub fn default_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|cores| cores.get() * 2)
        .unwrap_or(8)
}
