//! Deadlock watchdog
//!
//! A shard loop blocked inside a slow synchronous collaborator hook stops
//! draining its broadcast channel, and nothing else would notice. The
//! watchdog samples each shard's broadcast backlog on a timer and logs a
//! diagnostic snapshot when the depth crosses the high-water mark. It is
//! purely observational and takes no corrective action.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::hub::shard::{ShardHandle, WorkerTag};

/// Snapshot of one shard whose broadcast channel crossed the high-water mark
#[derive(Debug, Clone)]
pub(crate) struct BacklogReport {
    pub shard: usize,
    pub tag: WorkerTag,
    pub depth: usize,
    pub capacity: usize,
}

/// Sample every shard's broadcast backlog once.
///
/// Returns a report for each shard at or above `high_water` pending events.
pub(crate) fn sample(shards: &[ShardHandle], high_water: usize) -> Vec<BacklogReport> {
    shards
        .iter()
        .filter_map(|handle| {
            let (depth, capacity) = handle.broadcast_backlog();
            if depth > 0 && depth >= high_water {
                Some(BacklogReport {
                    shard: handle.index,
                    tag: handle.worker_tag(),
                    depth,
                    capacity,
                })
            } else {
                None
            }
        })
        .collect()
}

/// Spawn the periodic sampler; runs until `shutdown` is cancelled
pub(crate) fn spawn(
    shards: Vec<ShardHandle>,
    interval: Duration,
    high_water: usize,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for report in sample(&shards, high_water) {
                        error!(
                            "shard {} ({}) broadcast backlog at {}/{} events, loop may be stalled",
                            report.shard, report.tag, report.depth, report.capacity
                        );
                    }
                }
            }
        }
    })
}
