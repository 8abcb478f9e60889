//! Background task that evicts expired upload sessions on a fixed interval.

use crate::services::session_store::SessionStore;
use std::time::Duration;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawn the sweeper. It runs until `shutdown` is cancelled.
pub fn spawn_sweeper(
    store: SessionStore,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so a fresh server
        // does not sweep an empty store.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("session sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = store.sweep_expired();
                    if removed > 0 {
                        info!("sweeper removed {} expired upload sessions", removed);
                    }
                }
            }
        }
    })
}
