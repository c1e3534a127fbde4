//! Periodic housekeeping: duration expiry, missing-data rules, insight refresh
//! and prescription expiry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::dispatcher::IngestionHandle;
use super::programs::ProgramService;
use super::rules::RuleEngine;
use super::MonitoringError;
use crate::session::PrescriptionService;

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub programs_expired: usize,
    pub missing_alerts: usize,
    pub insights_refreshed: usize,
    pub prescriptions_expired: usize,
}

#[derive(Debug, Clone)]
pub struct Housekeeper {
    programs: ProgramService,
    rules: RuleEngine,
    ingestion: Option<IngestionHandle>,
    prescriptions: Option<PrescriptionService>,
}

impl Housekeeper {
    pub fn new(programs: ProgramService, rules: RuleEngine) -> Self {
        Self {
            programs,
            rules,
            ingestion: None,
            prescriptions: None,
        }
    }

    /// Retire ingestion actors of programs that expire.
    pub fn with_ingestion(mut self, handle: IngestionHandle) -> Self {
        self.ingestion = Some(handle);
        self
    }

    pub fn with_prescriptions(mut self, prescriptions: PrescriptionService) -> Self {
        self.prescriptions = Some(prescriptions);
        self
    }

    /// Run one sweep. Per-program failures are logged and skipped.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport, MonitoringError> {
        let mut report = SweepReport::default();

        let expired = self.programs.expire_due(now)?;
        report.programs_expired = expired.len();
        if let Some(handle) = &self.ingestion {
            for program_id in &expired {
                handle.retire(*program_id);
            }
        }

        for program in self.programs.active_programs()? {
            match self.rules.sweep_missing(&program, now) {
                Ok(alerts) => report.missing_alerts += alerts.len(),
                Err(e) => {
                    tracing::warn!(program_id = %program.id, error = %e, "Missing-data sweep failed");
                }
            }
            match self.programs.refresh_insights(&program.id) {
                Ok(_) => report.insights_refreshed += 1,
                Err(e) => {
                    tracing::warn!(program_id = %program.id, error = %e, "Insight refresh failed");
                }
            }
        }

        if let Some(prescriptions) = &self.prescriptions {
            match prescriptions.expire_due(now) {
                Ok(expired) => report.prescriptions_expired = expired.len(),
                Err(e) => tracing::warn!(error = %e, "Prescription expiry failed"),
            }
        }

        tracing::debug!(?report, "Housekeeping sweep finished");
        Ok(report)
    }
}

/// Handle to the periodic housekeeping task.
pub struct HousekeepingTask {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HousekeepingTask {
    /// Spawn the sweep loop. The first sweep runs immediately.
    pub fn spawn(housekeeper: Housekeeper, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = housekeeper.run_once(Utc::now()) {
                            tracing::error!("Housekeeping sweep failed: {e}");
                        }
                    }
                }
            }
            tracing::info!("Housekeeping task stopped");
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Housekeeping task failed: {e}");
            }
        }
    }
}
