//! Connection-quality sampling for in-progress sessions.
//!
//! One task per session, each with a oneshot shutdown signal. A tick whose
//! write finds the session no longer in progress also ends the task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::SessionError;
use crate::config::EngineConfig;
use crate::db::{self, Store};
use crate::models::{ConnectionGrade, QualitySnapshot};

/// Source of live connection metrics for a session.
pub trait QualitySource: Send + Sync {
    fn sample(&self, session_id: &Uuid) -> QualitySnapshot;
}

/// Random metrics in a plausible range. Stands in for a provider's stats feed.
#[derive(Debug, Default)]
pub struct SimulatedQualitySource;

impl QualitySource for SimulatedQualitySource {
    fn sample(&self, _session_id: &Uuid) -> QualitySnapshot {
        let mut rng = rand::thread_rng();
        let latency: f64 = rng.gen_range(20.0..400.0);
        let loss: f64 = rng.gen_range(0.0..8.0);
        let (resolution, bandwidth_kbps) = if latency < 150.0 {
            ("1280x720", rng.gen_range(1500..4000))
        } else {
            ("640x360", rng.gen_range(300..1500))
        };
        QualitySnapshot {
            patient_connection: grade(latency, loss),
            clinician_connection: grade(rng.gen_range(20.0..200.0), rng.gen_range(0.0..2.0)),
            average_latency_ms: latency,
            packet_loss_pct: loss,
            resolution: resolution.to_string(),
            bandwidth_kbps,
            sampled_at: Utc::now(),
        }
    }
}

pub fn grade(latency_ms: f64, packet_loss_pct: f64) -> ConnectionGrade {
    if latency_ms < 100.0 && packet_loss_pct < 1.0 {
        ConnectionGrade::Excellent
    } else if latency_ms < 200.0 && packet_loss_pct < 3.0 {
        ConnectionGrade::Good
    } else if latency_ms <= 300.0 && packet_loss_pct <= 5.0 {
        ConnectionGrade::Fair
    } else {
        ConnectionGrade::Poor
    }
}

/// Limits past which a sample counts as degraded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QosBounds {
    pub max_latency_ms: f64,
    pub max_packet_loss_pct: f64,
}

impl QosBounds {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_latency_ms: config.qos_max_latency_ms,
            max_packet_loss_pct: config.qos_max_packet_loss_pct,
        }
    }

    pub fn is_degraded(&self, snapshot: &QualitySnapshot) -> bool {
        snapshot.average_latency_ms > self.max_latency_ms
            || snapshot.packet_loss_pct > self.max_packet_loss_pct
    }
}

impl Default for QosBounds {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// UI event emitted when a sample crosses the bounds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityDegraded {
    pub session_id: Uuid,
    pub average_latency_ms: f64,
    pub packet_loss_pct: f64,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct QosSampler {
    store: Arc<Store>,
    source: Arc<dyn QualitySource>,
    events: Option<mpsc::Sender<QualityDegraded>>,
    bounds: QosBounds,
    interval: Duration,
    running: Arc<Mutex<HashMap<Uuid, oneshot::Sender<()>>>>,
}

impl QosSampler {
    pub fn new(store: Arc<Store>, source: Arc<dyn QualitySource>, config: &EngineConfig) -> Self {
        Self {
            store,
            source,
            events: None,
            bounds: QosBounds::from_config(config),
            interval: config.qos_interval().max(Duration::from_millis(1)),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Deliver `QualityDegraded` events on `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<QualityDegraded>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Start sampling a session. No-op when already sampling it or when
    /// called outside a tokio runtime.
    pub fn activate(&self, session_id: Uuid) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!(session_id = %session_id, "No async runtime, QoS sampling disabled");
                return;
            }
        };

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        {
            let Ok(mut running) = self.running.lock() else {
                tracing::error!("QoS task table lock poisoned");
                return;
            };
            if running.contains_key(&session_id) {
                return;
            }
            running.insert(session_id, shutdown_tx);
        }

        let sampler = self.clone();
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(sampler.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        match sampler.sample_once(&session_id) {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => {
                                tracing::warn!(session_id = %session_id, error = %e, "QoS sample failed");
                            }
                        }
                    }
                }
            }
            sampler.forget(&session_id);
            tracing::debug!(session_id = %session_id, "QoS sampler stopped");
        });
        tracing::info!(session_id = %session_id, "QoS sampler started");
    }

    /// Stop sampling a session.
    pub fn deactivate(&self, session_id: &Uuid) {
        let tx = match self.running.lock() {
            Ok(mut running) => running.remove(session_id),
            Err(_) => None,
        };
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    pub fn is_active(&self, session_id: &Uuid) -> bool {
        self.running
            .lock()
            .map(|running| running.contains_key(session_id))
            .unwrap_or(false)
    }

    /// Take and store one sample.
    ///
    /// Returns `false` when the session is no longer in progress; nothing is
    /// written in that case.
    pub fn sample_once(&self, session_id: &Uuid) -> Result<bool, SessionError> {
        let snapshot = self.source.sample(session_id);
        let written = self
            .store
            .with_conn(|conn| db::update_session_quality(conn, session_id, &snapshot))
            .map_err(SessionError::from)?;
        if !written {
            return Ok(false);
        }

        if self.bounds.is_degraded(&snapshot) {
            tracing::warn!(
                session_id = %session_id,
                latency_ms = snapshot.average_latency_ms,
                packet_loss_pct = snapshot.packet_loss_pct,
                "Connection quality degraded"
            );
            if let Some(tx) = &self.events {
                let event = QualityDegraded {
                    session_id: *session_id,
                    average_latency_ms: snapshot.average_latency_ms,
                    packet_loss_pct: snapshot.packet_loss_pct,
                    sampled_at: snapshot.sampled_at,
                };
                if let Err(e) = tx.try_send(event) {
                    tracing::debug!(session_id = %session_id, "QualityDegraded event dropped: {e}");
                }
            }
        }
        Ok(true)
    }

    fn forget(&self, session_id: &Uuid) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(session_id);
        }
    }
}

impl std::fmt::Debug for QosSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QosSampler")
            .field("bounds", &self.bounds)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
