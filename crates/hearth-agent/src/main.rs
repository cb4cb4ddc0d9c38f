use std::sync::Arc;

use crate::config::{ConfigStore, JsonConfigStore};
use crate::health::HealthMonitor;
use crate::orchestrator::StartupOrchestrator;
use crate::runtime::SystemRuntime;
use crate::supervisor::ProcessSupervisor;

mod config;
mod console;
mod diagnosis;
mod error;
mod events;
mod health;
mod orchestrator;
mod runtime;
mod safety;
mod supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store_path = config::data_root().join("servers.json");
    let store: Arc<dyn ConfigStore> = Arc::new(JsonConfigStore::open(store_path).await?);

    let supervisor = ProcessSupervisor::new(store.clone());
    let orchestrator = Arc::new(StartupOrchestrator::new(
        supervisor.clone(),
        store.clone(),
        Arc::new(SystemRuntime),
    ));
    let monitor = HealthMonitor::new(supervisor.clone(), store.clone(), orchestrator.clone());

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "hearth-agent starting");

    // Bring auto-start servers up before the monitor begins sweeping, so a
    // slow boot is not mistaken for a zombie.
    for cfg in store.all().await? {
        if !cfg.auto_start {
            continue;
        }
        match orchestrator.start(&cfg, false).await {
            Ok(outcome) => {
                tracing::info!(server_id = %cfg.id, ?outcome, "auto-start issued");
            }
            Err(err) => {
                tracing::error!(
                    server_id = %cfg.id,
                    code = err.code(),
                    error = %err,
                    "auto-start failed"
                );
            }
        }
    }

    tokio::spawn(monitor.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested; stopping live servers");

    for cfg in store.all().await.unwrap_or_default() {
        if !supervisor.is_live(&cfg.id).await {
            continue;
        }
        if let Err(err) = supervisor.request_stop(&cfg.id, true).await {
            tracing::warn!(server_id = %cfg.id, error = %err, "graceful stop failed");
        }
    }
    // Give stop commands a moment to land before the process exits and the
    // parent-death signal tears the children down anyway.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    Ok(())
}
