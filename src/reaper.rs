use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::MemoryCache;
use crate::store::LocalStore;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that physically drops expired keys from the in-process cache.
/// Expired index buckets and abandoned reservation locks are already invisible; this
/// only bounds memory.
pub async fn run_sweeper(cache: Arc<MemoryCache>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let purged = cache.purge_expired();
        if purged > 0 {
            debug!(purged, remaining = cache.len(), "swept expired cache keys");
        }
    }
}

/// Background task that rewrites the store journal once enough appends piled up.
pub async fn run_compactor(store: Arc<LocalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if compact_if_needed(&store, threshold).await {
            info!(bookings = store.booking_count(), "journal compacted");
        }
    }
}

async fn compact_if_needed(store: &LocalStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold.max(1) {
        return false;
    }
    match store.compact().await {
        Ok(()) => true,
        Err(e) => {
            warn!(appends, error = %e, "journal compaction failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheClient;
    use crate::journal::Journal;
    use crate::model::*;
    use crate::store::BookingStore;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_journal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("consultd_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn window(expert_id: Ulid, i: i64) -> UnavailabilityWindow {
        let start = 1_772_409_600_000 + i * HOUR_MS;
        UnavailabilityWindow {
            id: Ulid::new(),
            expert_id,
            start,
            end: start + 30 * MINUTE_MS,
            recurrence: None,
            until: None,
            reason: None,
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_journal_path("compact_threshold.journal");
        let store = LocalStore::open(&path).unwrap();
        let expert = Ulid::new();

        let windows: Vec<_> = (0..4).map(|i| window(expert, i)).collect();
        for w in &windows {
            store.add_unavailability(w.clone()).await.unwrap();
        }
        store.remove_unavailability(windows[0].id).await.unwrap();
        assert_eq!(store.appends_since_compact().await, 5);

        assert!(!compact_if_needed(&store, 10).await);
        assert!(compact_if_needed(&store, 5).await);
        assert_eq!(store.appends_since_compact().await, 0);

        // Only the three surviving windows remain.
        let records = Journal::replay(&path).unwrap();
        assert_eq!(records.len(), 3);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn in_memory_store_never_compacts() {
        let store = LocalStore::in_memory();
        assert!(!compact_if_needed(&store, 0).await);
    }

    #[tokio::test]
    async fn sweep_removes_expired_keys() {
        let cache = Arc::new(MemoryCache::new());
        cache.set_ex("gone", "x", Duration::from_millis(1)).await.unwrap();
        cache.set_ex("kept", "y", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
