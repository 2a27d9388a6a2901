//! Crash recovery for shard loops
//!
//! Each shard's run loop executes inside a recoverable frame: a panic is
//! caught, logged with a snapshot of the loop's state, and the loop is
//! relaunched with the same channels and connection list it held before the
//! crash. Events mid-broadcast at crash time may be lost for connections not
//! yet processed; availability wins over redelivery here. An explicit Stop is
//! terminal and never restarted.
//!
//! Restarts back off with a doubling delay so a persistently panicking
//! collaborator hook cannot turn the shard into a restart storm.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::hub::shard::{ExitReason, ShardState, WorkerTag};

/// First restart delay after a crash
const RESTART_DELAY_BASE: Duration = Duration::from_millis(50);
/// Upper bound on the restart delay
const RESTART_DELAY_CAP: Duration = Duration::from_secs(5);
/// A run lasting at least this long resets the crash streak
const HEALTHY_RUN: Duration = Duration::from_secs(30);

/// Spawn a shard loop inside its supervising task.
///
/// `generation` is the shard handle's worker-tag generation counter; it is
/// bumped before every (re)start so diagnostics can tell runs apart.
pub(crate) fn spawn_supervised(
    mut state: ShardState,
    generation: Arc<std::sync::atomic::AtomicU64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut crash_streak: u32 = 0;

        loop {
            let tag = WorkerTag {
                shard: state.index(),
                generation: generation.fetch_add(1, Ordering::SeqCst) + 1,
            };
            debug!("shard {} loop starting as {}", state.index(), tag);

            let started = Instant::now();
            let outcome = AssertUnwindSafe(state.run()).catch_unwind().await;

            match outcome {
                Ok(ExitReason::Stopped) => {
                    debug!("{} stopped explicitly", tag);
                    break;
                }
                Ok(ExitReason::Detached) => {
                    debug!("{} detached, registry gone", tag);
                    break;
                }
                Err(payload) => {
                    if state.explicit_stop() {
                        break;
                    }

                    if started.elapsed() >= HEALTHY_RUN {
                        crash_streak = 0;
                    }
                    let delay = restart_delay(crash_streak);
                    crash_streak = crash_streak.saturating_add(1);

                    error!(
                        "{} crashed: {}; {} connections held; restarting in {:?}",
                        tag,
                        panic_message(payload.as_ref()),
                        state.connection_count(),
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    })
}

fn restart_delay(crash_streak: u32) -> Duration {
    let factor = 1u32.checked_shl(crash_streak).unwrap_or(u32::MAX);
    RESTART_DELAY_BASE
        .checked_mul(factor)
        .map(|delay| delay.min(RESTART_DELAY_CAP))
        .unwrap_or(RESTART_DELAY_CAP)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
