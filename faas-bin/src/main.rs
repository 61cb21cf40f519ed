mod transport;

use std::sync::Arc;

use color_eyre::eyre;
use faas_executor::{Engine, EngineConfig, ProcessInstanceManager};
use tracing::info;

use crate::transport::TcpNdjsonTransport;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("starting invoker engine");

    let config = EngineConfig::from_env();
    info!(
        core_count = config.core_count,
        hot_cap = config.hot_cap,
        snap_cap = config.snap_cap,
        reuse_cap = config.reuse_cap,
        "engine configuration loaded"
    );

    // The process-backed `ProcessInstanceManager` stands in for the real
    // unikernel hypervisor (C1), which is an external dependency this crate
    // only talks to through the `InstanceManager` trait.
    let instance_manager = Arc::new(ProcessInstanceManager::new(config.vm_port));
    let engine = Arc::new(Engine::new(config, instance_manager));

    let listen_addr =
        std::env::var("FAAS_CONTROLLER_ADDR").unwrap_or_else(|_| "0.0.0.0:7000".to_string());
    let transport = TcpNdjsonTransport::bind(&listen_addr).await?;

    engine.run(transport).await?;
    Ok(())
}
