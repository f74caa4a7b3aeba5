use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "consultd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "consultd_request_duration_seconds";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: bookings created.
pub const BOOKINGS_CREATED_TOTAL: &str = "consultd_bookings_created_total";

/// Counter: lifecycle transitions applied. Labels: action.
pub const TRANSITIONS_TOTAL: &str = "consultd_transitions_total";

/// Counter: conflict checks. Labels: source (cache|store), verdict (free|conflict).
pub const CONFLICT_CHECKS_TOTAL: &str = "consultd_conflict_checks_total";

/// Counter: availability index operations that failed. Labels: op.
pub const INDEX_ERRORS_TOTAL: &str = "consultd_index_errors_total";

/// Counter: index hits the store no longer considered blocking, evicted on sight.
pub const INDEX_STALE_EVICTIONS_TOTAL: &str = "consultd_index_stale_evictions_total";

/// Counter: reservation lock attempts. Labels: outcome (acquired|contended).
pub const LOCK_ACQUIRE_TOTAL: &str = "consultd_lock_acquire_total";

/// Counter: outbox items that were dropped or failed to deliver. Labels: kind.
pub const OUTBOX_FAILURES_TOTAL: &str = "consultd_outbox_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "consultd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "consultd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "consultd_connections_rejected_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "consultd_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (records per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "consultd_journal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
