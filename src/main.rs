use std::sync::Arc;

use tracing::info;

use slotguard::config::Config;
use slotguard::policy::PolicyBook;
use slotguard::reaper::SweepSettings;
use slotguard::tenant::TenantManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotguard::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;
    let policies = PolicyBook::load(&config.policy_file)?;

    let tenant_manager = Arc::new(
        TenantManager::new(config.data_dir.clone(), config.compact_threshold, policies).with_sweep(
            SweepSettings {
                interval: config.sweep_interval,
                unblock_batch: config.unblock_batch,
            },
        ),
    );
    let tenants = tenant_manager.open_existing()?;

    info!("slotguard running");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  policy_file: {}", config.policy_file.display());
    info!("  tenants: {}", tenants.len());
    info!("  sweep_interval: {:?}", config.sweep_interval);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown on SIGTERM/ctrl-c. Every commit is fsynced before it
    // is acknowledged, so there is nothing to flush on the way out.
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutdown signal received");
    info!("slotguard stopped with {} tenants loaded", tenant_manager.tenant_count());
    Ok(())
}
