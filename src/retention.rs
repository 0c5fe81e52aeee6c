use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use crate::store::Store;

/// Default retention horizon: records older than this are swept away.
const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Periodic sweeper external to the ingestion-and-fan-out core (spec.md §1,
/// §4.4): calls `Store::delete_older_than(now - RETENTION)` on a schedule,
/// the same interval-loop shape the teacher uses for its own task cleanup.
pub async fn run(store: Arc<dyn Store>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let cutoff = Utc::now() - chrono::Duration::from_std(DEFAULT_RETENTION).unwrap();
        match store.delete_older_than(cutoff).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(deleted, "retention sweep removed records");
                }
            }
            Err(e) => error!(error = %e, "retention sweep failed"),
        }
    }
}
