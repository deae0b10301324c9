use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "bookit_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "bookit_request_duration_seconds";

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: holds successfully placed.
pub const HOLDS_PLACED_TOTAL: &str = "bookit_holds_placed_total";

/// Counter: hold requests rejected by conflict. Labels: reason (hold, slot).
pub const HOLDS_REJECTED_TOTAL: &str = "bookit_holds_rejected_total";

/// Counter: holds that reached their deadline unconsumed.
pub const HOLDS_EXPIRED_TOTAL: &str = "bookit_holds_expired_total";

/// Counter: holds released before confirm or expiry.
pub const HOLDS_RELEASED_TOTAL: &str = "bookit_holds_released_total";

/// Gauge: holds currently registered and not yet consumed, released or evicted.
pub const HOLDS_LIVE: &str = "bookit_holds_live";

/// Counter: holds promoted to confirmed slots.
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "bookit_bookings_confirmed_total";

/// Counter: confirmed slots cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "bookit_bookings_cancelled_total";

/// Counter: rejected credentials. Labels: token (api, schedule).
pub const AUTH_FAILURES_TOTAL: &str = "bookit_auth_failures_total";

// ── Storage ─────────────────────────────────────────────────────

/// Counter: read retries after `Unavailable`. Labels: op.
pub const STORE_RETRIES_TOTAL: &str = "bookit_store_retries_total";

/// Counter: store calls that hit the timeout. Labels: op.
pub const STORE_TIMEOUTS_TOTAL: &str = "bookit_store_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookit_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookit_wal_flush_batch_size";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bookit_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bookit_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bookit_connections_rejected_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
