use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::holds::HoldRegistry;
use crate::store::WalStore;

/// Background task that periodically evicts expired holds.
pub async fn run_reaper(holds: Arc<HoldRegistry>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let reaped = holds.sweep_expired();
        if reaped > 0 {
            info!("reaped {reaped} expired hold(s)");
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulated.
pub async fn run_compactor(store: WalStore, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
        debug!("next compaction check in {every:?}");
    }
}
