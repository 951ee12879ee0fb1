use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineError};
use crate::policy::Policy;

/// Background settings for one tenant's sweeps.
#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub interval: Duration,
    pub unblock_batch: usize,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            unblock_batch: 500,
        }
    }
}

/// What one sweep pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub holds_expired: usize,
    pub blocks_lifted: usize,
    pub confirmations_expired: usize,
    pub locks_pruned: usize,
}

/// One pass over every time-driven transition: expired holds, blocks due
/// to lift, and unanswered confirmations. A failing step is logged and the
/// rest still run.
pub async fn sweep_once(engine: &Engine, policy: &Policy, settings: &SweepSettings) -> SweepReport {
    let started = Instant::now();
    let mut report = SweepReport::default();

    report.holds_expired = log_step("hold reaper", engine.reap_expired_holds().await);
    report.blocks_lifted = log_step(
        "unblock sweep",
        engine.unblock_expired(policy, settings.unblock_batch).await,
    );
    report.confirmations_expired =
        log_step("confirmation sweep", engine.sweep_confirmations().await);
    report.locks_pruned = engine.prune_locks();

    metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    debug!("sweep done: {report:?}");
    report
}

fn log_step(name: &str, result: Result<usize, EngineError>) -> usize {
    match result {
        Ok(n) => n,
        Err(e) if e.is_retryable() => {
            warn!("{name} failed, will retry next pass: {e}");
            0
        }
        Err(e) => {
            error!("{name} failed: {e}");
            0
        }
    }
}

/// Background task that runs [`sweep_once`] on a fixed interval.
pub async fn run_reaper(engine: Arc<Engine>, policy: Policy, settings: SweepSettings) {
    let mut interval = tokio::time::interval(settings.interval);
    loop {
        interval.tick().await;
        sweep_once(&engine, &policy, &settings).await;
    }
}

/// Background task that compacts the WAL once enough commits pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} commits"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
