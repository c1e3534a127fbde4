use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application-level constants
pub const APP_NAME: &str = "Telecare";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Overrides the data directory (defaults to ~/Telecare).
pub const DATA_DIR_ENV: &str = "TELECARE_DATA_DIR";

/// Overrides the QoS sampling interval in seconds.
pub const QOS_INTERVAL_ENV: &str = "TELECARE_QOS_INTERVAL_SECS";

/// Default tracing filter when RUST_LOG is unset.
pub fn default_log_filter() -> &'static str {
    "telecare=info,telecare_lib=info"
}

/// Get the application data directory
pub fn app_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

/// Get the tenants directory
pub fn tenants_dir() -> PathBuf {
    app_data_dir().join("tenants")
}

/// Database file for one tenant.
pub fn tenant_db_path(tenant_id: &str) -> PathBuf {
    tenants_dir().join(tenant_id).join("telecare.db")
}

/// Tunables for the monitoring and session engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum values retained per (program, parameter) window.
    pub history_cap: usize,
    /// Prior values used for mean / standard deviation.
    pub anomaly_lookback: usize,
    /// Prior values required before anomaly detection applies.
    pub anomaly_min_history: usize,
    /// z-score above which a value is anomalous.
    pub anomaly_z_threshold: f64,
    /// Seconds between connection-quality samples.
    pub qos_interval_secs: u64,
    /// Latency above which quality is degraded.
    pub qos_max_latency_ms: f64,
    /// Packet loss above which quality is degraded.
    pub qos_max_packet_loss_pct: f64,
    /// Seconds between housekeeping sweeps.
    pub housekeeping_interval_secs: u64,
    /// Bounded queue depth per program actor.
    pub program_queue_depth: usize,
    /// Bounded queue depth for the ingestion router.
    pub router_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_cap: 1000,
            anomaly_lookback: 10,
            anomaly_min_history: 3,
            anomaly_z_threshold: 2.0,
            qos_interval_secs: 30,
            qos_max_latency_ms: 300.0,
            qos_max_packet_loss_pct: 5.0,
            housekeeping_interval_secs: 60,
            program_queue_depth: 64,
            router_queue_depth: 256,
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = std::env::var(QOS_INTERVAL_ENV)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
        {
            config.qos_interval_secs = secs;
        }
        config
    }

    pub fn qos_interval(&self) -> Duration {
        Duration::from_secs(self.qos_interval_secs.max(1))
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs.max(1))
    }
}
