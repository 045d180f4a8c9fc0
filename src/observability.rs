use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total ingress requests. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "reservd_requests_total";

/// Histogram: ingress request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "reservd_request_duration_seconds";

/// Counter: admission decisions. Labels: kind (capacity|overlap), outcome.
pub const ADMISSIONS_TOTAL: &str = "reservd_admissions_total";

/// Histogram: admission latency in seconds, from trigger to terminal status. Labels: kind.
pub const ADMISSION_DURATION_SECONDS: &str = "reservd_admission_duration_seconds";

/// Counter: bookings cancelled by suspension cascades. Labels: path (group|individual).
pub const CASCADE_CANCELLATIONS_TOTAL: &str = "reservd_cascade_cancellations_total";

/// Counter: cascade batches re-queried after a precondition failure.
pub const CASCADE_RETRIES_TOTAL: &str = "reservd_cascade_retries_total";

/// Counter: cancellation notices delivered to subscribers.
pub const NOTICES_DELIVERED_TOTAL: &str = "reservd_notices_delivered_total";

/// Counter: stale pending bookings re-admitted by the sweeper.
pub const SWEEP_READMITTED_TOTAL: &str = "reservd_sweep_readmitted_total";

/// Counter: change-feed events missed by the trigger dispatcher.
pub const TRIGGER_LAGGED_TOTAL: &str = "reservd_trigger_lagged_total";

// ── Store internals ─────────────────────────────────────────────

/// Counter: durable commits.
pub const COMMITS_TOTAL: &str = "reservd_commits_total";

/// Histogram: documents touched per commit.
pub const COMMIT_WRITES: &str = "reservd_commit_writes";

/// Histogram: transaction latency in seconds, including retries.
pub const TX_DURATION_SECONDS: &str = "reservd_tx_duration_seconds";

/// Counter: transaction attempts discarded because their reads went stale.
pub const TX_CONFLICTS_TOTAL: &str = "reservd_tx_conflicts_total";

/// Counter: transactions that gave up after exhausting their attempts.
pub const TX_EXHAUSTED_TOTAL: &str = "reservd_tx_exhausted_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservd_wal_flush_batch_size";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reservd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reservd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reservd_connections_rejected_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
