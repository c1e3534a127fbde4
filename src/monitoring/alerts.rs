//! Human review of raised alerts. Status is the only mutable alert field.
//!
//! ACTIVE → ACKNOWLEDGED → RESOLVED; ACTIVE may also resolve directly.
//! Any non-final alert may be marked FALSE_POSITIVE.

use std::sync::Arc;

use uuid::Uuid;

use super::MonitoringError;
use crate::db::{self, Store};
use crate::models::{AlertStatus, MonitoringAlert};

#[derive(Debug, Clone)]
pub struct AlertReview {
    store: Arc<Store>,
}

impl AlertReview {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn get(&self, alert_id: &Uuid) -> Result<MonitoringAlert, MonitoringError> {
        self.store
            .with_conn(|conn| db::get_alert(conn, alert_id).map_err(MonitoringError::from))?
            .ok_or(MonitoringError::NotFound {
                entity: "alert",
                id: *alert_id,
            })
    }

    pub fn acknowledge(&self, alert_id: &Uuid) -> Result<MonitoringAlert, MonitoringError> {
        self.transition(alert_id, &[AlertStatus::Active], AlertStatus::Acknowledged)
    }

    pub fn resolve(&self, alert_id: &Uuid) -> Result<MonitoringAlert, MonitoringError> {
        self.transition(
            alert_id,
            &[AlertStatus::Active, AlertStatus::Acknowledged],
            AlertStatus::Resolved,
        )
    }

    pub fn mark_false_positive(&self, alert_id: &Uuid) -> Result<MonitoringAlert, MonitoringError> {
        self.transition(
            alert_id,
            &[AlertStatus::Active, AlertStatus::Acknowledged],
            AlertStatus::FalsePositive,
        )
    }

    fn transition(
        &self,
        alert_id: &Uuid,
        allowed: &[AlertStatus],
        to: AlertStatus,
    ) -> Result<MonitoringAlert, MonitoringError> {
        let alert = self.store.with_tx(|tx| {
            let current = db::get_alert(tx, alert_id)?.ok_or(MonitoringError::NotFound {
                entity: "alert",
                id: *alert_id,
            })?;
            if !allowed.contains(&current.status) {
                return Err(MonitoringError::InvalidState(format!(
                    "cannot move alert from {} to {}",
                    current.status, to
                )));
            }
            if !db::update_alert_status(tx, alert_id, current.status, to)? {
                return Err(MonitoringError::InvalidState("alert status changed concurrently".into()));
            }
            db::get_alert(tx, alert_id)?.ok_or(MonitoringError::NotFound {
                entity: "alert",
                id: *alert_id,
            })
        })?;

        tracing::info!(alert_id = %alert_id, status = %to, "Alert reviewed");
        Ok(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::{
        AlertCondition, AlertRule, AlertSeverity, MonitoringProgram, ProgramStatus, ProgramType,
    };

    fn setup() -> (AlertReview, MonitoringAlert) {
        let store = Arc::new(Store::in_memory("tenant-test").unwrap());
        let now = Utc::now();
        let program = MonitoringProgram {
            id: Uuid::new_v4(),
            patient_id: "pat-1".into(),
            clinician_id: "dr-lee".into(),
            program_type: ProgramType::VitalSigns,
            sampling_minutes: 60,
            duration_days: 30,
            started_at: now,
            status: ProgramStatus::Active,
            insights: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let rule = AlertRule {
            id: Uuid::new_v4(),
            program_id: program.id,
            parameter: "heart_rate".into(),
            condition: AlertCondition::Above,
            threshold: 120.0,
            severity: AlertSeverity::Critical,
            enabled: true,
            actions: Vec::new(),
            created_at: now,
        };
        let alert = MonitoringAlert {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            program_id: program.id,
            measurement_id: None,
            parameter: "heart_rate".into(),
            value: Some(130.0),
            message: "heart_rate 130 above threshold 120".into(),
            severity: AlertSeverity::Critical,
            status: AlertStatus::Active,
            actions: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        store
            .with_conn(|conn| {
                db::insert_program(conn, &program)?;
                db::insert_alert_rule(conn, &rule)?;
                db::insert_alert(conn, &alert)
            })
            .unwrap();
        (AlertReview::new(store), alert)
    }

    #[test]
    fn acknowledge_then_resolve() {
        let (review, alert) = setup();
        assert_eq!(review.acknowledge(&alert.id).unwrap().status, AlertStatus::Acknowledged);
        assert!(matches!(review.acknowledge(&alert.id), Err(MonitoringError::InvalidState(_))));
        let resolved = review.resolve(&alert.id).unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert_eq!(resolved.message, alert.message);
    }

    #[test]
    fn final_states_accept_no_transition() {
        let (review, alert) = setup();
        review.mark_false_positive(&alert.id).unwrap();
        assert!(matches!(review.resolve(&alert.id), Err(MonitoringError::InvalidState(_))));
        assert!(matches!(review.acknowledge(&alert.id), Err(MonitoringError::InvalidState(_))));
        assert_eq!(review.get(&alert.id).unwrap().status, AlertStatus::FalsePositive);
    }

    #[test]
    fn unknown_alert_not_found() {
        let (review, _) = setup();
        assert!(matches!(
            review.acknowledge(&Uuid::new_v4()),
            Err(MonitoringError::NotFound { entity: "alert", .. })
        ));
    }
}
