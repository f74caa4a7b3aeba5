use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use chrono_tz::Tz;
use tracing::warn;
use ulid::Ulid;

use crate::cache::{CacheClient, CacheError};
use crate::calendar;
use crate::model::*;

/// Per-owner, per-day cache of active bookings.
///
/// Layout:
/// - `avail:{expert|user}:{owner_id}:{YYYY-MM-DD}` → set of booking ids (the day bucket)
/// - `avail:booking:{booking_id}` → JSON `IndexEntry`
///
/// Days are computed in the booking timezone so buckets line up with working hours.
/// Nothing here is authoritative: every failure is logged and surfaces as a miss.
pub struct AvailabilityIndex {
    cache: Arc<dyn CacheClient>,
    tz: Tz,
    ttl_margin: Duration,
    op_timeout: Duration,
}

fn bucket_key(kind: OwnerKind, owner_id: Ulid, date: NaiveDate) -> String {
    format!("avail:{}:{owner_id}:{}", kind.as_str(), date.format("%Y-%m-%d"))
}

fn entry_key(booking_id: Ulid) -> String {
    format!("avail:booking:{booking_id}")
}

impl AvailabilityIndex {
    pub fn new(cache: Arc<dyn CacheClient>, tz: Tz, ttl_margin: Duration, op_timeout: Duration) -> Self {
        Self {
            cache,
            tz,
            ttl_margin,
            op_timeout,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Bounded time for one cache round-trip; a timeout is reported like any cache error.
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(CacheError("timed out".into())),
        }
    }

    fn ttl_after(&self, until: Ms, now: Ms) -> Duration {
        let remaining = (until - now).max(0) as u64;
        Duration::from_millis(remaining) + self.ttl_margin
    }

    /// Upsert the projection and reference it from the expert-day and user-day buckets.
    pub async fn put(&self, entry: &IndexEntry, now: Ms) {
        if let Err(e) = self.try_put(entry, now).await {
            warn!(booking = %entry.booking_id, error = %e, "index put failed");
            metrics::counter!(crate::observability::INDEX_ERRORS_TOTAL, "op" => "put").increment(1);
        }
    }

    async fn try_put(&self, entry: &IndexEntry, now: Ms) -> Result<(), CacheError> {
        let blob = serde_json::to_string(entry).map_err(|e| CacheError(e.to_string()))?;
        let id = entry.booking_id.to_string();
        let date = calendar::local_date(self.tz, entry.start);
        let bucket_ttl = self.ttl_after(calendar::day_span(self.tz, date).end, now);

        self.bounded(self.cache.set_ex(&entry_key(entry.booking_id), &blob, self.ttl_after(entry.end(), now)))
            .await?;
        for kind in [OwnerKind::Expert, OwnerKind::User] {
            let key = bucket_key(kind, entry.owner_id(kind), date);
            self.bounded(self.cache.sadd(&key, &id)).await?;
            self.bounded(self.cache.expire(&key, bucket_ttl)).await?;
        }
        Ok(())
    }

    /// Remove a booking from both buckets and drop its projection. No-op if absent.
    pub async fn remove(&self, booking_id: Ulid) {
        if let Err(e) = self.try_remove(booking_id).await {
            warn!(booking = %booking_id, error = %e, "index remove failed");
            metrics::counter!(crate::observability::INDEX_ERRORS_TOTAL, "op" => "remove").increment(1);
        }
    }

    async fn try_remove(&self, booking_id: Ulid) -> Result<(), CacheError> {
        let key = entry_key(booking_id);
        let Some(blob) = self.bounded(self.cache.get(&key)).await? else {
            return Ok(());
        };
        let entry: IndexEntry = serde_json::from_str(&blob).map_err(|e| CacheError(e.to_string()))?;
        self.unlink(&entry).await?;
        self.bounded(self.cache.del(&key)).await
    }

    async fn unlink(&self, entry: &IndexEntry) -> Result<(), CacheError> {
        let id = entry.booking_id.to_string();
        let date = calendar::local_date(self.tz, entry.start);
        for kind in [OwnerKind::Expert, OwnerKind::User] {
            let key = bucket_key(kind, entry.owner_id(kind), date);
            self.bounded(self.cache.srem(&key, &id)).await?;
        }
        Ok(())
    }

    /// Replace whatever the index holds for `booking` with its current state: blocking
    /// bookings are (re)indexed under their current date, others are removed.
    pub async fn sync(&self, booking: &Booking, now: Ms) {
        let result: Result<(), CacheError> = async {
            if let Some(blob) = self.bounded(self.cache.get(&entry_key(booking.id))).await? {
                let old: IndexEntry =
                    serde_json::from_str(&blob).map_err(|e| CacheError(e.to_string()))?;
                self.unlink(&old).await?;
            }
            if booking.status.is_blocking() {
                self.try_put(&IndexEntry::from(booking), now).await
            } else {
                self.bounded(self.cache.del(&entry_key(booking.id))).await
            }
        }
        .await;
        if let Err(e) = result {
            warn!(booking = %booking.id, error = %e, "index sync failed");
            metrics::counter!(crate::observability::INDEX_ERRORS_TOTAL, "op" => "sync").increment(1);
        }
    }

    /// Every projection in one owner's day bucket. Evicted projections are skipped.
    /// `None` means the index could not answer and the caller must ask the store.
    pub async fn list_for_owner_day(
        &self,
        kind: OwnerKind,
        owner_id: Ulid,
        date: NaiveDate,
    ) -> Option<Vec<IndexEntry>> {
        match self.try_list(kind, owner_id, date).await {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!(owner = %owner_id, kind = kind.as_str(), %date, error = %e, "index read failed");
                metrics::counter!(crate::observability::INDEX_ERRORS_TOTAL, "op" => "list").increment(1);
                None
            }
        }
    }

    async fn try_list(
        &self,
        kind: OwnerKind,
        owner_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<IndexEntry>, CacheError> {
        let ids = self.bounded(self.cache.smembers(&bucket_key(kind, owner_id, date))).await?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(id) = id.parse::<Ulid>() else {
                continue;
            };
            let Some(blob) = self.bounded(self.cache.get(&entry_key(id))).await? else {
                continue;
            };
            match serde_json::from_str::<IndexEntry>(&blob) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::debug!(booking = %id, error = %e, "skipping unreadable projection"),
            }
        }
        entries.sort_by_key(|e| e.start);
        Ok(entries)
    }
}
