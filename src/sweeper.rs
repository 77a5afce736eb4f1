use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{now_ms, Engine};

/// Background task that settles classes once they start and expires
/// pending_payment bookings that outlived their TTL.
pub async fn run_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let now = now_ms();

        for class_id in engine.collect_elapsed_classes(now) {
            match engine.settle_elapsed_class(class_id, now).await {
                Ok(settled) => info!("settled class {class_id}: {settled} bookings"),
                Err(e) => {
                    // Another writer may have got there first — that's fine
                    tracing::debug!("sweeper skip class {class_id}: {e}");
                }
            }
        }

        for booking_id in engine.collect_stale_pending(now) {
            match engine.expire_pending_payment(booking_id).await {
                Ok(()) => info!("expired unpaid booking {booking_id}"),
                Err(e) => {
                    // Payment may have landed since the sweep collected the id
                    tracing::debug!("sweeper skip booking {booking_id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
/// Compaction aborts on lock contention, so a busy engine just waits for
/// the next tick.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::debug!("compactor skip: {e}"),
        }
    }
}
