use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::model::Ms;
use crate::observability;
use crate::store::{Store, now_ms};
use crate::trigger::sweep_pending;

/// Background task that periodically re-admits bookings stuck in `pending`
/// for longer than `stale_after`, e.g. because the process stopped between
/// the write and its admission.
pub async fn run_sweeper(store: Arc<Store>, every: Duration, stale_after: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // the dispatcher already swept on startup
    loop {
        interval.tick().await;
        let cutoff = now_ms() - stale_after.as_millis() as Ms;
        match sweep_pending(&store, Some(cutoff)).await {
            Ok(0) => debug!("sweeper: nothing stale"),
            Ok(n) => {
                info!("sweeper re-admitted {n} stale pending bookings");
                metrics::counter!(observability::SWEEP_READMITTED_TOTAL).increment(n as u64);
            }
            Err(e) => error!("sweeper failed: {e}"),
        }
    }
}

/// Background task that compacts the WAL once enough commits accumulated.
pub async fn run_compactor(store: Arc<Store>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}
