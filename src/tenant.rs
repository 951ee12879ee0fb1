use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::clock::Clock;
use crate::engine::Engine;
use crate::limits::*;
use crate::outbox::Outbox;
use crate::policy::{Policy, PolicyBook};
use crate::reaper::{self, SweepSettings};

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + reaper,
/// so holds, bookings and trust records never cross tenants.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    policies: PolicyBook,
    sweep: SweepSettings,
    clock: Clock,
}

fn sanitize(tenant: &str) -> std::io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    // Sanitize tenant name to prevent path traversal
    let safe_name: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe_name.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    Ok(safe_name)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, policies: PolicyBook) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            policies,
            sweep: SweepSettings::default(),
            clock: Clock::System,
        }
    }

    pub fn with_sweep(mut self, sweep: SweepSettings) -> Self {
        self.sweep = sweep;
        self
    }

    /// Engines created from here on read time from `clock`.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Resolved policy for a tenant: vertical defaults, then vertical and
    /// tenant overrides from the policy book.
    pub fn policy_for(&self, tenant: &str) -> Policy {
        self.policies.resolve(tenant)
    }

    /// Get or lazily create an engine for the given tenant.
    ///
    /// Engines are keyed by the sanitized name, which is also the WAL file
    /// name, so two spellings of one tenant share one engine. The engine is
    /// built inside the map entry; only the caller that inserts it starts
    /// its reaper and compactor.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        let safe_name = sanitize(tenant)?;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path, Arc::new(Outbox::new()), self.clock.clone())?);
                slot.insert(engine.clone());
                engine
            }
        };

        // Spawn reaper + compactor for this tenant
        let reaper_engine = engine.clone();
        let policy = self.policy_for(&safe_name);
        let sweep = self.sweep.clone();
        tokio::spawn(async move {
            reaper::run_reaper(reaper_engine, policy, sweep).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold).await;
        });

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!("tenant {safe_name} opened");
        Ok(engine)
    }

    /// Load every tenant that already has a WAL in the data directory, so
    /// their sweeps resume before any request arrives. Returns the names.
    pub fn open_existing(&self) -> std::io::Result<Vec<String>> {
        let mut opened = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "wal") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            self.get_or_create(name)?;
            opened.push(name.to_string());
        }
        opened.sort();
        info!("opened {} existing tenants", opened.len());
        Ok(opened)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}
