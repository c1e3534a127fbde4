//! Measurement ingestion for a single program.
//!
//! A `ProgramIngestor` owns the trailing windows of one program and must be
//! driven by one caller at a time (the dispatcher gives each program its own
//! actor). Windows are loaded lazily from the durable log tail.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rules::RuleEngine;
use super::window::{AnomalyDetector, MeasurementWindow};
use super::MonitoringError;
use crate::config::EngineConfig;
use crate::db::{self, Store};
use crate::models::{
    MeasurementInput, MonitoringAlert, MonitoringMeasurement, MonitoringProgram, ProgramStatus,
    Reliability,
};

/// A processed measurement together with the alerts it raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub measurement: MonitoringMeasurement,
    pub alerts: Vec<MonitoringAlert>,
}

pub struct ProgramIngestor {
    program_id: Uuid,
    store: Arc<Store>,
    rules: RuleEngine,
    detector: AnomalyDetector,
    history_cap: usize,
    windows: HashMap<String, MeasurementWindow>,
}

impl ProgramIngestor {
    pub fn new(program_id: Uuid, store: Arc<Store>, rules: RuleEngine, config: &EngineConfig) -> Self {
        Self {
            program_id,
            store,
            rules,
            detector: AnomalyDetector::from_config(config),
            history_cap: config.history_cap,
            windows: HashMap::new(),
        }
    }

    pub fn program_id(&self) -> Uuid {
        self.program_id
    }

    /// Loaded window for a parameter, if any measurement has been seen.
    pub fn window(&self, parameter: &str) -> Option<&MeasurementWindow> {
        self.windows.get(parameter)
    }

    /// Validate, score, persist and evaluate one measurement.
    pub fn ingest(&mut self, input: MeasurementInput) -> Result<MeasurementRecord, MonitoringError> {
        validate_input(&input)?;
        self.check_program_active()?;

        let parameter = input.parameter.trim().to_string();
        self.load_window(&parameter)?;
        let window = self
            .windows
            .get(&parameter)
            .ok_or_else(|| MonitoringError::InvalidState("measurement window unavailable".into()))?;

        let previous = window.latest();
        let assessment = self.detector.assess(window, input.value);
        let measurement = MonitoringMeasurement {
            id: Uuid::new_v4(),
            program_id: self.program_id,
            device_id: input.device_id,
            parameter: parameter.clone(),
            value: input.value,
            unit: input.unit,
            captured_at: input.timestamp,
            reliability: input.reliability,
            is_anomaly: assessment.is_anomaly,
            needs_review: assessment.is_anomaly || input.reliability == Reliability::Low,
            z_score: assessment.z_score,
        };

        let program_id = self.program_id;
        let rules = &self.rules;
        let (program, pending) = self.store.with_tx(|tx| {
            // Re-read inside the transaction so a concurrent pause is honored.
            let program = db::get_program(tx, &program_id)?
                .ok_or(MonitoringError::ProgramNotFound(program_id))?;
            if program.status != ProgramStatus::Active {
                return Err(MonitoringError::InvalidState(format!(
                    "program is {}, not active",
                    program.status
                )));
            }
            if let Some(device_id) = measurement.device_id {
                let device = db::get_device(tx, &device_id)?.ok_or_else(|| {
                    MonitoringError::Validation(format!("device {device_id} is not registered"))
                })?;
                if device.program_id != program_id {
                    return Err(MonitoringError::Validation(format!(
                        "device {device_id} belongs to another program"
                    )));
                }
                if !device.measures(&measurement.parameter) {
                    return Err(MonitoringError::Validation(format!(
                        "device {device_id} does not measure {}",
                        measurement.parameter
                    )));
                }
            }

            db::insert_measurement(tx, &measurement)?;
            if let Some(device_id) = measurement.device_id {
                db::touch_device(tx, &device_id, Utc::now())?;
            }
            let pending = rules.evaluate(tx, &program, &measurement, previous)?;
            Ok::<_, MonitoringError>((program, pending))
        })?;

        if let Some(window) = self.windows.get_mut(&parameter) {
            window.push(measurement.value);
        }

        if measurement.needs_review {
            tracing::info!(
                measurement_id = %measurement.id,
                program_id = %program_id,
                parameter = %measurement.parameter,
                is_anomaly = measurement.is_anomaly,
                z_score = ?measurement.z_score,
                "Measurement flagged for review"
            );
        } else {
            tracing::debug!(
                measurement_id = %measurement.id,
                program_id = %program_id,
                parameter = %measurement.parameter,
                "Measurement ingested"
            );
        }

        let alerts = self.rules.dispatch(&program, pending);
        Ok(MeasurementRecord { measurement, alerts })
    }

    /// Fails unless the program exists and is active. A program whose
    /// duration has elapsed is completed here before being rejected.
    fn check_program_active(&self) -> Result<MonitoringProgram, MonitoringError> {
        let program = self
            .store
            .with_conn(|conn| db::get_program(conn, &self.program_id).map_err(MonitoringError::from))?
            .ok_or(MonitoringError::ProgramNotFound(self.program_id))?;

        if program.status == ProgramStatus::Active && program.is_expired(Utc::now()) {
            let completed = self.store.with_conn(|conn| {
                db::update_program_status(conn, &program.id, ProgramStatus::Active, ProgramStatus::Completed)
            })?;
            if completed {
                tracing::info!(program_id = %program.id, "Program duration elapsed, marked completed");
            }
            return Err(MonitoringError::InvalidState("program duration has elapsed".into()));
        }
        if program.status != ProgramStatus::Active {
            return Err(MonitoringError::InvalidState(format!(
                "program is {}, not active",
                program.status
            )));
        }
        Ok(program)
    }

    fn load_window(&mut self, parameter: &str) -> Result<(), MonitoringError> {
        if self.windows.contains_key(parameter) {
            return Ok(());
        }
        let history = self.store.with_conn(|conn| {
            db::get_recent_measurements(conn, &self.program_id, parameter, self.history_cap)
        })?;
        let window = MeasurementWindow::from_history(self.history_cap, history.iter().map(|m| m.value));
        self.windows.insert(parameter.to_string(), window);
        Ok(())
    }
}

impl std::fmt::Debug for ProgramIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramIngestor")
            .field("program_id", &self.program_id)
            .field("parameters", &self.windows.len())
            .finish_non_exhaustive()
    }
}

fn validate_input(input: &MeasurementInput) -> Result<(), MonitoringError> {
    if input.parameter.trim().is_empty() {
        return Err(MonitoringError::Validation("parameter is required".into()));
    }
    if !input.value.is_finite() {
        return Err(MonitoringError::Validation(format!(
            "value for {} must be a finite number",
            input.parameter
        )));
    }
    Ok(())
}
