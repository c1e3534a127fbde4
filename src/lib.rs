pub mod config;
pub mod db;
pub mod device_registry;
pub mod engine;
pub mod models;
pub mod monitoring;
pub mod notify;
pub mod session;
pub mod signing;
pub mod vitals;

use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineError};

/// Serve one tenant until Ctrl-C.
pub fn run(tenant_id: &str) -> Result<(), EngineError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut engine = Engine::open_tenant(tenant_id, EngineConfig::from_env())?;

        if let Some(mut events) = engine.take_quality_events() {
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    tracing::warn!(
                        session_id = %event.session_id,
                        latency_ms = event.average_latency_ms,
                        packet_loss_pct = event.packet_loss_pct,
                        "QualityDegraded"
                    );
                }
            });
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
        }
        tracing::info!("Shutdown requested");
        engine.shutdown().await;
        Ok(())
    })
}
