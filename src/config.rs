use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::lock::LockConfig;

/// Knobs the booking engine itself reads.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Zone used to bucket bookings by local date and to interpret working hours.
    pub timezone: Tz,
    /// Confirmed bookings cannot be cancelled closer than this to their start.
    pub cancel_lead_minutes: i64,
    pub lock: LockConfig,
    /// Bound on each availability-index round-trip.
    pub cache_timeout: Duration,
    /// Bound on each system-of-record call.
    pub store_timeout: Duration,
    /// How long an index bucket outlives the end of its latest booking.
    pub index_ttl_margin: Duration,
    pub outbox_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            cancel_lead_minutes: 60,
            lock: LockConfig::default(),
            cache_timeout: Duration::from_millis(250),
            store_timeout: Duration::from_secs(2),
            index_ttl_margin: Duration::from_secs(168 * 3600),
            outbox_capacity: 1024,
        }
    }
}

/// Process configuration, read from `CONSULTD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// `redis://...` selects Redis; unset keeps the cache in-process.
    pub cache_url: Option<String>,
    pub engine: EngineConfig,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parsed<T: FromStr>(name: &str, default: T) -> T {
    var(name).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn millis(name: &str, default: Duration) -> Duration {
    var(name)
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let defaults = EngineConfig::default();

        let timezone = match var("CONSULTD_TIMEZONE") {
            Some(name) => name
                .trim()
                .parse::<Tz>()
                .map_err(|e| format!("CONSULTD_TIMEZONE: {e}"))?,
            None => defaults.timezone,
        };

        let lock = LockConfig {
            ttl: millis("CONSULTD_LOCK_TTL_MS", defaults.lock.ttl),
            timeout: millis("CONSULTD_LOCK_TIMEOUT_MS", defaults.lock.timeout),
            retries: parsed("CONSULTD_LOCK_RETRIES", defaults.lock.retries),
            retry_delay: millis("CONSULTD_LOCK_RETRY_DELAY_MS", defaults.lock.retry_delay),
        };

        let ttl_margin_hours: u64 = parsed(
            "CONSULTD_INDEX_TTL_MARGIN_HOURS",
            defaults.index_ttl_margin.as_secs() / 3600,
        );

        let engine = EngineConfig {
            timezone,
            cancel_lead_minutes: parsed("CONSULTD_CANCEL_LEAD_MINUTES", defaults.cancel_lead_minutes),
            lock,
            cache_timeout: millis("CONSULTD_CACHE_TIMEOUT_MS", defaults.cache_timeout),
            store_timeout: millis("CONSULTD_STORE_TIMEOUT_MS", defaults.store_timeout),
            index_ttl_margin: Duration::from_secs(ttl_margin_hours * 3600),
            outbox_capacity: parsed("CONSULTD_OUTBOX_CAPACITY", defaults.outbox_capacity),
        };

        Ok(Self {
            bind: var("CONSULTD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed("CONSULTD_PORT", 7433),
            data_dir: PathBuf::from(var("CONSULTD_DATA_DIR").unwrap_or_else(|| "./data".into())),
            max_connections: parsed("CONSULTD_MAX_CONNECTIONS", 256),
            compact_threshold: parsed("CONSULTD_COMPACT_THRESHOLD", 1000),
            metrics_port: var("CONSULTD_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            cache_url: var("CONSULTD_CACHE_URL"),
            engine,
        })
    }
}
