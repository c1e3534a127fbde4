//! Monitoring program management: enrollment, rules and status transitions.
//!
//! Program lifecycle: ACTIVE ⇄ PAUSED → {COMPLETED, CANCELLED}.
//! Duration expiry completes active and paused programs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::insights;
use super::rules::MAX_MISSING_MINUTES;
use super::MonitoringError;
use crate::db::{self, Store};
use crate::models::{
    AlertCondition, AlertRule, MonitoringAlert, MonitoringMeasurement, MonitoringProgram,
    NewAlertRule, NewProgram, ParameterInsight, ProgramStatus,
};

#[derive(Debug, Clone)]
pub struct ProgramService {
    store: Arc<Store>,
}

impl ProgramService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Enroll a patient. The program starts active immediately.
    pub fn enroll(&self, request: NewProgram) -> Result<MonitoringProgram, MonitoringError> {
        if request.patient_id.trim().is_empty() || request.clinician_id.trim().is_empty() {
            return Err(MonitoringError::Validation("patient and clinician are required".into()));
        }
        if request.sampling_minutes == 0 {
            return Err(MonitoringError::Validation("sampling frequency must be positive".into()));
        }
        if request.duration_days == 0 {
            return Err(MonitoringError::Validation("duration must be at least one day".into()));
        }

        let now = Utc::now();
        let program = MonitoringProgram {
            id: Uuid::new_v4(),
            patient_id: request.patient_id,
            clinician_id: request.clinician_id,
            program_type: request.program_type,
            sampling_minutes: request.sampling_minutes,
            duration_days: request.duration_days,
            started_at: now,
            status: ProgramStatus::Active,
            insights: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.with_conn(|conn| db::insert_program(conn, &program))?;

        tracing::info!(
            program_id = %program.id,
            program_type = %program.program_type,
            duration_days = program.duration_days,
            "Patient enrolled in monitoring program"
        );
        Ok(program)
    }

    pub fn get(&self, program_id: &Uuid) -> Result<MonitoringProgram, MonitoringError> {
        self.store
            .with_conn(|conn| db::get_program(conn, program_id).map_err(MonitoringError::from))?
            .ok_or(MonitoringError::ProgramNotFound(*program_id))
    }

    pub fn list_for_patient(&self, patient_id: &str) -> Result<Vec<MonitoringProgram>, MonitoringError> {
        Ok(self
            .store
            .with_conn(|conn| db::list_programs_by_patient(conn, patient_id))?)
    }

    /// Attach a validated rule to a non-terminal program.
    pub fn add_rule(&self, program_id: &Uuid, request: NewAlertRule) -> Result<AlertRule, MonitoringError> {
        validate_rule(&request)?;
        let rule = AlertRule {
            id: Uuid::new_v4(),
            program_id: *program_id,
            parameter: request.parameter.trim().to_string(),
            condition: request.condition,
            threshold: request.threshold,
            severity: request.severity,
            enabled: true,
            actions: request.actions,
            created_at: Utc::now(),
        };

        self.store.with_tx(|tx| {
            let program = db::get_program(tx, program_id)?
                .ok_or(MonitoringError::ProgramNotFound(*program_id))?;
            if program.status.is_terminal() {
                return Err(MonitoringError::InvalidState(format!(
                    "cannot add rules to a {} program",
                    program.status
                )));
            }
            db::insert_alert_rule(tx, &rule)?;
            Ok(())
        })?;

        tracing::info!(
            rule_id = %rule.id,
            program_id = %program_id,
            parameter = %rule.parameter,
            condition = %rule.condition,
            "Alert rule added"
        );
        Ok(rule)
    }

    pub fn set_rule_enabled(&self, rule_id: &Uuid, enabled: bool) -> Result<AlertRule, MonitoringError> {
        self.store.with_tx(|tx| {
            if db::get_alert_rule(tx, rule_id)?.is_none() {
                return Err(MonitoringError::NotFound {
                    entity: "alert_rule",
                    id: *rule_id,
                });
            }
            db::set_alert_rule_enabled(tx, rule_id, enabled)?;
            db::get_alert_rule(tx, rule_id)?.ok_or(MonitoringError::NotFound {
                entity: "alert_rule",
                id: *rule_id,
            })
        })
    }

    pub fn rules(&self, program_id: &Uuid) -> Result<Vec<AlertRule>, MonitoringError> {
        Ok(self.store.with_conn(|conn| db::get_rules_by_program(conn, program_id))?)
    }

    pub fn measurements(&self, program_id: &Uuid) -> Result<Vec<MonitoringMeasurement>, MonitoringError> {
        Ok(self
            .store
            .with_conn(|conn| db::get_measurements_by_program(conn, program_id))?)
    }

    pub fn alerts(&self, program_id: &Uuid) -> Result<Vec<MonitoringAlert>, MonitoringError> {
        Ok(self.store.with_conn(|conn| db::get_alerts_by_program(conn, program_id))?)
    }

    pub fn pause(&self, program_id: &Uuid) -> Result<MonitoringProgram, MonitoringError> {
        self.transition(program_id, &[ProgramStatus::Active], ProgramStatus::Paused)
    }

    /// Resume a paused program. Expired programs are completed instead.
    pub fn resume(&self, program_id: &Uuid) -> Result<MonitoringProgram, MonitoringError> {
        let program = self.get(program_id)?;
        if program.status == ProgramStatus::Paused && program.is_expired(Utc::now()) {
            self.transition(program_id, &[ProgramStatus::Paused], ProgramStatus::Completed)?;
            return Err(MonitoringError::InvalidState("program duration has elapsed".into()));
        }
        self.transition(program_id, &[ProgramStatus::Paused], ProgramStatus::Active)
    }

    pub fn complete(&self, program_id: &Uuid) -> Result<MonitoringProgram, MonitoringError> {
        self.transition(
            program_id,
            &[ProgramStatus::Active, ProgramStatus::Paused],
            ProgramStatus::Completed,
        )
    }

    pub fn cancel(&self, program_id: &Uuid) -> Result<MonitoringProgram, MonitoringError> {
        self.transition(
            program_id,
            &[ProgramStatus::Active, ProgramStatus::Paused],
            ProgramStatus::Cancelled,
        )
    }

    /// Complete every active or paused program whose duration has elapsed.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, MonitoringError> {
        let expired = self.store.with_tx(|tx| {
            let mut expired = Vec::new();
            for status in [ProgramStatus::Active, ProgramStatus::Paused] {
                for program in db::list_programs_by_status(tx, status)? {
                    if program.is_expired(now)
                        && db::update_program_status(tx, &program.id, status, ProgramStatus::Completed)?
                    {
                        expired.push(program.id);
                    }
                }
            }
            Ok::<_, MonitoringError>(expired)
        })?;

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Monitoring programs expired");
        }
        Ok(expired)
    }

    /// Recompute and store trend summaries from the measurement log.
    pub fn refresh_insights(&self, program_id: &Uuid) -> Result<Vec<ParameterInsight>, MonitoringError> {
        self.store.with_tx(|tx| {
            if db::get_program(tx, program_id)?.is_none() {
                return Err(MonitoringError::ProgramNotFound(*program_id));
            }
            let log = db::get_measurements_by_program(tx, program_id)?;
            let summary = insights::compute(&log);
            db::update_program_insights(tx, program_id, &summary)?;
            Ok(summary)
        })
    }

    pub fn active_programs(&self) -> Result<Vec<MonitoringProgram>, MonitoringError> {
        Ok(self
            .store
            .with_conn(|conn| db::list_programs_by_status(conn, ProgramStatus::Active))?)
    }

    fn transition(
        &self,
        program_id: &Uuid,
        allowed: &[ProgramStatus],
        to: ProgramStatus,
    ) -> Result<MonitoringProgram, MonitoringError> {
        let program = self.store.with_tx(|tx| {
            let program = db::get_program(tx, program_id)?
                .ok_or(MonitoringError::ProgramNotFound(*program_id))?;
            if !allowed.contains(&program.status) {
                return Err(MonitoringError::InvalidState(format!(
                    "cannot move program from {} to {}",
                    program.status, to
                )));
            }
            if !db::update_program_status(tx, program_id, program.status, to)? {
                return Err(MonitoringError::InvalidState("program status changed concurrently".into()));
            }
            db::get_program(tx, program_id)?.ok_or(MonitoringError::ProgramNotFound(*program_id))
        })?;

        tracing::info!(program_id = %program_id, status = %to, "Program status changed");
        Ok(program)
    }
}

fn validate_rule(rule: &NewAlertRule) -> Result<(), MonitoringError> {
    if rule.parameter.trim().is_empty() {
        return Err(MonitoringError::Validation("rule parameter is required".into()));
    }
    if !rule.threshold.is_finite() {
        return Err(MonitoringError::Validation("rule threshold must be a finite number".into()));
    }
    match rule.condition {
        AlertCondition::Missing if rule.threshold <= 0.0 || rule.threshold > MAX_MISSING_MINUTES => {
            Err(MonitoringError::Validation(format!(
                "missing-data threshold must be between 0 and {MAX_MISSING_MINUTES} minutes"
            )))
        }
        AlertCondition::Change if rule.threshold < 0.0 => Err(MonitoringError::Validation(
            "change threshold must not be negative".into(),
        )),
        _ => Ok(()),
    }
}
