//! Background rate-limit synchronization
//!
//! Periodically asks every live client for its current rate-limit windows
//! and folds them into the pool. This catches quota spent outside this
//! process (other tools sharing the same credentials) before a fetch runs
//! into it. Failures only warn; request-time classification still handles
//! anything the sync misses.

use std::sync::Arc;
use std::time::Duration;

use remote::ErrorClassification;
use tracing::{debug, info, warn};

use crate::pool::Pool;
use crate::quota::classify;

/// Spawn a task that runs `sync_cycle` every `interval`.
///
/// The first tick is skipped; callers run one cycle themselves at startup.
pub fn spawn_sync_task(pool: Arc<Pool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sync_cycle(&pool).await;
        }
    })
}

/// Poll each live client once. Returns how many were synced.
pub async fn sync_cycle(pool: &Pool) -> usize {
    let mut synced = 0usize;
    for (index, id, api) in pool.sync_targets() {
        match api.rate_limit_status().await {
            Ok(windows) => {
                for (category, snapshot) in &windows {
                    pool.seed(index, *category, *snapshot);
                }
                debug!(client = %id, windows = windows.len(), "rate limits synced");
                synced += 1;
            }
            Err(e) => match classify(&e) {
                ErrorClassification::CredentialRejected => {
                    warn!(client = %id, error = %e, "rate-limit sync rejected credentials");
                }
                _ => {
                    warn!(client = %id, error = %e, "rate-limit sync failed, will retry next cycle");
                }
            },
        }
    }
    info!(synced, "rate-limit sync cycle finished");
    synced
}
