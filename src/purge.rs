//! Background hard-purge sweep (spec §4.6 "Hard purge"): periodically
//! removes soft-deleted backups whose `purge_at` has passed and cleans up
//! their objects. Under the key-value backend this degrades to a no-op on
//! the store side (the table's native TTL attribute reaps the row) but the
//! loop still runs so a future KV table without TTL configured would be
//! covered.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::broker::ObjectBroker;
use crate::ratelimit::RateLimiter;
use crate::store::Store;

/// `tick_interval` is `Settings::purge_interval_seconds` (default 60s, spec
/// §4.7); tests can pass a shorter interval to exercise a sweep without
/// waiting a full minute.
pub async fn run(
    store: Arc<dyn Store>,
    broker: Arc<dyn ObjectBroker>,
    limiter: Arc<RateLimiter>,
    tick_interval: Duration,
) {
    let mut interval = tokio::time::interval(tick_interval);
    loop {
        interval.tick().await;
        limiter.evict_stale();

        match store.purge_due(Utc::now()).await {
            Ok(purged) if purged.is_empty() => {}
            Ok(purged) => {
                info!(count = purged.len(), "purging expired soft-deleted backups");
                for backup in purged {
                    broker
                        .delete_backup_objects(&backup.blob_key, &backup.manifest_key)
                        .await;
                }
            }
            Err(e) => {
                warn!(error = %e, "purge sweep failed, will retry next tick");
            }
        }
    }
}
