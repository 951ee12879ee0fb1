use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

// ── Slot holds ──────────────────────────────────────────────────

/// Counter: holds granted.
pub const HOLDS_GRANTED_TOTAL: &str = "slotguard_holds_granted_total";

/// Counter: hold requests turned away. Labels: reason.
pub const HOLDS_REJECTED_TOTAL: &str = "slotguard_holds_rejected_total";

/// Counter: holds moved to expired by the reaper.
pub const HOLDS_REAPED_TOTAL: &str = "slotguard_holds_reaped_total";

// ── Bookings ────────────────────────────────────────────────────

/// Counter: bookings written.
pub const BOOKINGS_COMMITTED_TOTAL: &str = "slotguard_bookings_committed_total";

/// Counter: booking commits refused. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "slotguard_bookings_rejected_total";

// ── Trust ───────────────────────────────────────────────────────

/// Counter: penalties logged. Labels: kind.
pub const PENALTIES_TOTAL: &str = "slotguard_penalties_total";

/// Counter: automatic blocks created.
pub const AUTO_BLOCKS_TOTAL: &str = "slotguard_auto_blocks_total";

/// Counter: blocks lifted because their time ran out.
pub const UNBLOCKS_TOTAL: &str = "slotguard_unblocks_total";

// ── Confirmations ───────────────────────────────────────────────

/// Counter: auto-actions fired on expired confirmations. Labels: action.
pub const CONFIRMATION_AUTO_ACTIONS_TOTAL: &str = "slotguard_confirmation_auto_actions_total";

// ── Resources ───────────────────────────────────────────────────

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotguard_tenants_active";

/// Histogram: time spent in one background sweep pass, in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "slotguard_sweep_duration_seconds";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotguard_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotguard_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
