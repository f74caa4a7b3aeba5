use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::cache::CacheClient;

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Auto-expiry, so a crashed holder cannot wedge the slot.
    pub ttl: Duration,
    /// Bound on a single acquire round-trip.
    pub timeout: Duration,
    /// Extra attempts after the first.
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            timeout: Duration::from_millis(300),
            retries: 3,
            retry_delay: Duration::from_millis(50),
        }
    }
}

/// Proof of holding the reservation lock for one (expert, day). Pass back to `release`.
#[derive(Debug)]
#[must_use = "a held reservation lock must be released"]
pub struct LockGuard {
    key: String,
    token: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Distributed mutual exclusion over `(expert_id, date)` scopes, built on the cache's
/// set-if-absent with TTL.
pub struct ReservationLocks {
    cache: Arc<dyn CacheClient>,
    config: LockConfig,
}

pub fn lock_key(expert_id: Ulid, date: NaiveDate) -> String {
    format!("lock:reserve:{expert_id}:{}", date.format("%Y-%m-%d"))
}

impl ReservationLocks {
    pub fn new(cache: Arc<dyn CacheClient>, config: LockConfig) -> Self {
        Self { cache, config }
    }

    /// Try to take the lock, retrying a few times. `None` means the scope stayed
    /// contended (or the lock service was unreachable) for every attempt.
    pub async fn acquire(&self, expert_id: Ulid, date: NaiveDate) -> Option<LockGuard> {
        let key = lock_key(expert_id, date);
        let token = Ulid::new().to_string();

        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            let outcome = tokio::time::timeout(
                self.config.timeout,
                self.cache.set_nx(&key, &token, self.config.ttl),
            )
            .await;
            match outcome {
                Ok(Ok(true)) => {
                    metrics::counter!(crate::observability::LOCK_ACQUIRE_TOTAL, "outcome" => "acquired")
                        .increment(1);
                    return Some(LockGuard { key, token });
                }
                Ok(Ok(false)) => debug!(%key, attempt, "reservation lock busy"),
                Ok(Err(e)) => warn!(%key, attempt, error = %e, "reservation lock error"),
                Err(_) => warn!(%key, attempt, "reservation lock timed out"),
            }
        }

        metrics::counter!(crate::observability::LOCK_ACQUIRE_TOTAL, "outcome" => "contended")
            .increment(1);
        None
    }

    /// Release only if we still own it; an expired-and-retaken lock is left alone.
    pub async fn release(&self, guard: LockGuard) {
        let outcome = tokio::time::timeout(
            self.config.timeout,
            self.cache.del_if_eq(&guard.key, &guard.token),
        )
        .await;
        match outcome {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => warn!(key = %guard.key, "reservation lock expired before release"),
            Ok(Err(e)) => warn!(key = %guard.key, error = %e, "reservation lock release failed"),
            Err(_) => warn!(key = %guard.key, "reservation lock release timed out"),
        }
    }
}
