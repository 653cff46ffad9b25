use std::sync::Arc;

use tracing::{error, info};

use warren_core::admin::AdminServer;
use warren_core::agents::builtin_registry;
use warren_core::telemetry::init_tracing;
use warren_core::{RocksDbStateRepository, Runtime, RuntimeConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional
    let _ = dotenvy::dotenv();
    init_tracing("info,warren_core=debug");

    let config = RuntimeConfig::load()?;
    info!(
        agents = config.agents.len(),
        state_path = %config.state_path.display(),
        "Configuration loaded"
    );

    let repository = Arc::new(RocksDbStateRepository::open(&config.state_path)?);
    // Runs on the default in-process bus. Deployments that feed agents from
    // outside pass their own `Bus` through `RuntimeBuilder::bus`.
    let mut runtime = Runtime::builder(builtin_registry())
        .agents(config.agents.clone())
        .repository(repository)
        .build()?;
    runtime.start().await?;

    let admin_handle = if config.admin.enabled {
        let admin = AdminServer::for_runtime(config.admin.clone(), &runtime);
        info!("Admin API enabled at http://{}", admin.addr());
        Some(tokio::spawn(async move {
            if let Err(e) = admin.serve().await {
                error!("Admin server error: {}", e);
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");

    if let Some(handle) = admin_handle {
        handle.abort();
    }
    runtime.shutdown().await?;
    Ok(())
}
