//! Background job: report expired-unused tokens and delete dead rows.
//!
//! Runs on a fixed interval (the human token TTL unless configured) until
//! the shutdown channel flips to `true` or its sender goes away.

use crate::server::TokenServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

/// Spawn the pruning task. Call this once at startup.
pub fn spawn(
    server: Arc<TokenServer>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        interval.tick().await;
        info!(interval_secs = every.as_secs(), "prune loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match server.prune_expired_with_notify().await {
                        Ok(deleted) => debug!(deleted, "prune pass complete"),
                        Err(e) => error!("prune job failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("prune loop stopped");
    })
}
