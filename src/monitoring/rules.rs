//! Alert rule engine.
//!
//! Evaluation persists one alert per matching enabled rule (no deduplication),
//! then executes each enabled action through the notifier. Notification
//! failures are recorded on the alert as attempted, never propagated.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use super::MonitoringError;
use crate::db::{self, Store};
use crate::models::{
    ActionKind, ActionOutcome, AlertCondition, AlertRule, AlertSeverity, AlertStatus,
    ExecutedAction, MonitoringAlert, MonitoringMeasurement, MonitoringProgram, RuleAction,
};
use crate::notify::{Notification, NotificationPriority, Notifier, TargetRole};

/// Tolerance for the `equals` condition.
pub const EQUALS_EPSILON: f64 = 0.01;

/// Longest silence a `missing` rule may wait for, in minutes (one year).
pub const MAX_MISSING_MINUTES: f64 = 525_600.0;

/// An alert persisted inside the ingestion transaction, awaiting its actions.
#[derive(Debug, Clone)]
pub struct PendingAlert {
    pub alert: MonitoringAlert,
    pub actions: Vec<RuleAction>,
}

/// Silence window of a `missing` rule. `None` unless the threshold is a
/// positive number of minutes no greater than `MAX_MISSING_MINUTES`.
pub fn silence_window(threshold_minutes: f64) -> Option<chrono::Duration> {
    if !threshold_minutes.is_finite() || threshold_minutes <= 0.0 || threshold_minutes > MAX_MISSING_MINUTES {
        return None;
    }
    chrono::Duration::try_seconds((threshold_minutes * 60.0).round() as i64)
}

/// Whether a value-based rule matches. `missing` never matches here; it is
/// evaluated by the housekeeping sweep.
pub fn condition_matches(rule: &AlertRule, value: f64, previous: Option<f64>) -> bool {
    match rule.condition {
        AlertCondition::Above => value > rule.threshold,
        AlertCondition::Below => value < rule.threshold,
        AlertCondition::Equals => (value - rule.threshold).abs() < EQUALS_EPSILON,
        AlertCondition::Change => previous.is_some_and(|p| (value - p).abs() > rule.threshold),
        AlertCondition::Missing => false,
    }
}

fn describe(rule: &AlertRule, value: f64, previous: Option<f64>) -> String {
    match rule.condition {
        AlertCondition::Above => format!("{} {} above threshold {}", rule.parameter, value, rule.threshold),
        AlertCondition::Below => format!("{} {} below threshold {}", rule.parameter, value, rule.threshold),
        AlertCondition::Equals => format!("{} reached {} (target {})", rule.parameter, value, rule.threshold),
        AlertCondition::Change => format!(
            "{} changed from {} to {} (more than {})",
            rule.parameter,
            previous.unwrap_or(value),
            value,
            rule.threshold
        ),
        AlertCondition::Missing => format!("No {} measurement received", rule.parameter),
    }
}

fn priority_for(severity: AlertSeverity) -> NotificationPriority {
    match severity {
        AlertSeverity::Critical => NotificationPriority::Urgent,
        AlertSeverity::High => NotificationPriority::High,
        AlertSeverity::Medium | AlertSeverity::Low => NotificationPriority::Normal,
    }
}

fn new_alert(
    rule: &AlertRule,
    program_id: Uuid,
    measurement_id: Option<Uuid>,
    value: Option<f64>,
    message: String,
    now: DateTime<Utc>,
) -> MonitoringAlert {
    MonitoringAlert {
        id: Uuid::new_v4(),
        rule_id: rule.id,
        program_id,
        measurement_id,
        parameter: rule.parameter.clone(),
        value,
        message,
        severity: rule.severity,
        status: AlertStatus::Active,
        actions: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

#[derive(Clone)]
pub struct RuleEngine {
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
}

impl RuleEngine {
    pub fn new(store: Arc<Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Persist an alert for every enabled rule matching `measurement`.
    /// Runs on the caller's connection so the alerts commit with the measurement.
    pub fn evaluate(
        &self,
        conn: &Connection,
        program: &MonitoringProgram,
        measurement: &MonitoringMeasurement,
        previous: Option<f64>,
    ) -> Result<Vec<PendingAlert>, MonitoringError> {
        let rules = db::get_rules_by_program(conn, &program.id)?;
        let mut pending = Vec::new();
        for rule in rules
            .iter()
            .filter(|r| r.enabled && r.parameter == measurement.parameter)
        {
            if !condition_matches(rule, measurement.value, previous) {
                continue;
            }
            let alert = new_alert(
                rule,
                program.id,
                Some(measurement.id),
                Some(measurement.value),
                describe(rule, measurement.value, previous),
                Utc::now(),
            );
            db::insert_alert(conn, &alert)?;
            tracing::info!(
                alert_id = %alert.id,
                rule_id = %rule.id,
                program_id = %program.id,
                parameter = %rule.parameter,
                severity = %rule.severity,
                "Alert raised"
            );
            pending.push(PendingAlert {
                alert,
                actions: rule.actions.clone(),
            });
        }
        Ok(pending)
    }

    /// Raise alerts for enabled `missing` rules whose parameter has been silent
    /// for longer than the rule's threshold (minutes). One alert per silence
    /// window: a rule that already alerted since the last measurement is skipped.
    pub fn sweep_missing(
        &self,
        program: &MonitoringProgram,
        now: DateTime<Utc>,
    ) -> Result<Vec<MonitoringAlert>, MonitoringError> {
        let pending = self.store.with_tx(|tx| {
            let rules = db::get_rules_by_program(tx, &program.id)?;
            let mut pending = Vec::new();
            for rule in rules
                .iter()
                .filter(|r| r.enabled && r.condition == AlertCondition::Missing)
            {
                let silent_since = db::get_last_measurement_time(tx, &program.id, &rule.parameter)?
                    .map_or(program.started_at, |t| t.max(program.started_at));
                let Some(window) = silence_window(rule.threshold) else {
                    tracing::warn!(
                        rule_id = %rule.id,
                        threshold = rule.threshold,
                        "Missing-data rule has an unusable threshold, skipped"
                    );
                    continue;
                };
                if now - silent_since < window {
                    continue;
                }
                let already_alerted = db::get_last_alert_time_for_rule(tx, &rule.id)?
                    .is_some_and(|t| t >= silent_since);
                if already_alerted {
                    continue;
                }

                let silent_minutes = (now - silent_since).num_minutes();
                let alert = new_alert(
                    rule,
                    program.id,
                    None,
                    None,
                    format!(
                        "No {} measurement for {} minutes (expected within {})",
                        rule.parameter, silent_minutes, rule.threshold
                    ),
                    now,
                );
                db::insert_alert(tx, &alert)?;
                tracing::info!(
                    alert_id = %alert.id,
                    rule_id = %rule.id,
                    program_id = %program.id,
                    silent_minutes,
                    "Missing-data alert raised"
                );
                pending.push(PendingAlert {
                    alert,
                    actions: rule.actions.clone(),
                });
            }
            Ok::<_, MonitoringError>(pending)
        })?;

        Ok(self.dispatch(program, pending))
    }

    /// Execute the enabled actions of each pending alert and record what ran.
    /// Failures are logged and never undo the alert.
    pub fn dispatch(&self, program: &MonitoringProgram, pending: Vec<PendingAlert>) -> Vec<MonitoringAlert> {
        pending
            .into_iter()
            .map(|PendingAlert { mut alert, actions }| {
                let executed: Vec<ExecutedAction> = actions
                    .iter()
                    .filter(|a| a.enabled)
                    .map(|a| self.execute(program, &alert, a.kind))
                    .collect();

                if !executed.is_empty() {
                    let recorded = self
                        .store
                        .with_conn(|conn| db::record_alert_actions(conn, &alert.id, &executed));
                    if let Err(e) = recorded {
                        tracing::warn!(alert_id = %alert.id, error = %e, "Failed to record alert actions");
                    }
                }
                alert.actions = executed;
                alert
            })
            .collect()
    }

    fn execute(&self, program: &MonitoringProgram, alert: &MonitoringAlert, kind: ActionKind) -> ExecutedAction {
        let (target, role, notification) = compose(program, alert, kind);
        let outcome = match self.notifier.notify(target, role, &notification) {
            Ok(()) => ActionOutcome::Delivered,
            Err(e) => {
                tracing::warn!(
                    alert_id = %alert.id,
                    action = %kind,
                    error = %e,
                    "Alert action attempted, not confirmed"
                );
                ActionOutcome::AttemptedNotConfirmed { error: e.to_string() }
            }
        };
        ExecutedAction {
            kind,
            outcome,
            executed_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine").field("store", &self.store).finish_non_exhaustive()
    }
}

/// Role-scoped copy: clinicians get the clinical detail, patients a plain prompt.
fn compose<'a>(
    program: &'a MonitoringProgram,
    alert: &MonitoringAlert,
    kind: ActionKind,
) -> (&'a str, TargetRole, Notification) {
    let data = json!({
        "alert_id": alert.id,
        "program_id": program.id,
        "rule_id": alert.rule_id,
        "parameter": alert.parameter,
        "value": alert.value,
        "severity": alert.severity,
    });
    let priority = priority_for(alert.severity);

    let (title, category, priority) = match kind {
        ActionKind::NotifyPatient => {
            let message = if alert.measurement_id.is_none() {
                format!("We have not received your {} reading. Please take a measurement.", alert.parameter)
            } else {
                format!(
                    "Your recent {} reading needs attention. Your care team has been informed.",
                    alert.parameter
                )
            };
            let notification = Notification {
                title: "Health monitoring update".into(),
                message,
                category: "monitoring_reminder".into(),
                priority: NotificationPriority::Normal,
                data,
            };
            return (program.patient_id.as_str(), TargetRole::Patient, notification);
        }
        ActionKind::NotifyClinician => (
            format!("{} alert: {}", alert.severity, alert.parameter),
            "monitoring_alert",
            priority,
        ),
        ActionKind::CreateTask => (format!("Review {} reading", alert.parameter), "task", priority),
        ActionKind::ScheduleCall => (
            format!("Schedule a call about {}", alert.parameter),
            "schedule_call",
            priority,
        ),
        ActionKind::EmergencyProtocol => (
            format!("EMERGENCY: {}", alert.parameter),
            "emergency",
            NotificationPriority::Urgent,
        ),
    };

    let notification = Notification {
        title,
        message: format!("Patient {}: {}", program.patient_id, alert.message),
        category: category.to_string(),
        priority,
        data,
    };
    (program.clinician_id.as_str(), TargetRole::Clinician, notification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProgramStatus, ProgramType, Reliability};
    use crate::notify::{ChannelNotifier, LogNotifier, NotifyError};

    struct FailingNotifier;

    impl Notifier for FailingNotifier {
        fn notify(&self, _: &str, _: TargetRole, _: &Notification) -> Result<(), NotifyError> {
            Err(NotifyError::NotificationDeliveryFailed("gateway down".into()))
        }
    }

    fn program(started_at: DateTime<Utc>) -> MonitoringProgram {
        MonitoringProgram {
            id: Uuid::new_v4(),
            patient_id: "pat-1".into(),
            clinician_id: "dr-lee".into(),
            program_type: ProgramType::PainTracking,
            sampling_minutes: 60,
            duration_days: 30,
            started_at,
            status: ProgramStatus::Active,
            insights: Vec::new(),
            created_at: started_at,
            updated_at: started_at,
        }
    }

    fn rule(program_id: Uuid, condition: AlertCondition, threshold: f64, actions: Vec<RuleAction>) -> AlertRule {
        AlertRule {
            id: Uuid::new_v4(),
            program_id,
            parameter: "pain_level".into(),
            condition,
            threshold,
            severity: AlertSeverity::High,
            enabled: true,
            actions,
            created_at: Utc::now(),
        }
    }

    fn measurement(program_id: Uuid, value: f64) -> MonitoringMeasurement {
        MonitoringMeasurement {
            id: Uuid::new_v4(),
            program_id,
            device_id: None,
            parameter: "pain_level".into(),
            value,
            unit: "0-10".into(),
            captured_at: Utc::now(),
            reliability: Reliability::High,
            is_anomaly: false,
            needs_review: false,
            z_score: None,
        }
    }

    fn setup(notifier: Arc<dyn Notifier>) -> (Arc<Store>, RuleEngine, MonitoringProgram) {
        let store = Arc::new(Store::in_memory("tenant-test").unwrap());
        let p = program(Utc::now());
        store.with_conn(|conn| db::insert_program(conn, &p)).unwrap();
        let engine = RuleEngine::new(store.clone(), notifier);
        (store, engine, p)
    }

    fn evaluate_and_dispatch(
        store: &Store,
        engine: &RuleEngine,
        p: &MonitoringProgram,
        value: f64,
        previous: Option<f64>,
    ) -> Vec<MonitoringAlert> {
        let m = measurement(p.id, value);
        let pending = store
            .with_tx(|tx| {
                db::insert_measurement(tx, &m)?;
                engine.evaluate(tx, p, &m, previous)
            })
            .unwrap();
        engine.dispatch(p, pending)
    }

    #[test]
    fn condition_table() {
        let pid = Uuid::new_v4();
        let above = rule(pid, AlertCondition::Above, 7.0, vec![]);
        assert!(condition_matches(&above, 8.0, None));
        assert!(!condition_matches(&above, 7.0, None));
        assert!(!condition_matches(&above, 6.0, None));

        let below = rule(pid, AlertCondition::Below, 90.0, vec![]);
        assert!(condition_matches(&below, 89.9, None));
        assert!(!condition_matches(&below, 90.0, None));

        let equals = rule(pid, AlertCondition::Equals, 5.0, vec![]);
        assert!(condition_matches(&equals, 5.005, None));
        assert!(!condition_matches(&equals, 5.02, None));

        let change = rule(pid, AlertCondition::Change, 3.0, vec![]);
        assert!(!condition_matches(&change, 9.0, None));
        assert!(condition_matches(&change, 9.0, Some(5.0)));
        assert!(!condition_matches(&change, 7.0, Some(5.0)));

        let missing = rule(pid, AlertCondition::Missing, 30.0, vec![]);
        assert!(!condition_matches(&missing, 1.0, None));
    }

    #[test]
    fn above_rule_triggers_at_eight_not_seven() {
        let (store, engine, p) = setup(Arc::new(LogNotifier));
        let r = rule(p.id, AlertCondition::Above, 7.0, vec![RuleAction::enabled(ActionKind::NotifyClinician)]);
        store.with_conn(|conn| db::insert_alert_rule(conn, &r)).unwrap();

        assert!(evaluate_and_dispatch(&store, &engine, &p, 7.0, None).is_empty());
        assert!(evaluate_and_dispatch(&store, &engine, &p, 6.0, None).is_empty());
        let alerts = evaluate_and_dispatch(&store, &engine, &p, 8.0, None);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].status, AlertStatus::Active);
        assert_eq!(alerts[0].actions.len(), 1);
        assert_eq!(alerts[0].actions[0].outcome, ActionOutcome::Delivered);

        let stored = store.with_conn(|conn| db::get_alerts_by_program(conn, &p.id)).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].actions, alerts[0].actions);
    }

    #[test]
    fn matching_rules_fan_out() {
        let (store, engine, p) = setup(Arc::new(LogNotifier));
        for threshold in [5.0, 6.0] {
            let r = rule(p.id, AlertCondition::Above, threshold, vec![]);
            store.with_conn(|conn| db::insert_alert_rule(conn, &r)).unwrap();
        }
        let alerts = evaluate_and_dispatch(&store, &engine, &p, 8.0, None);
        assert_eq!(alerts.len(), 2);
        assert_ne!(alerts[0].rule_id, alerts[1].rule_id);
    }

    #[test]
    fn disabled_rules_and_actions_are_skipped() {
        let (store, engine, p) = setup(Arc::new(LogNotifier));
        let mut off = rule(p.id, AlertCondition::Above, 7.0, vec![]);
        off.enabled = false;
        let on = rule(
            p.id,
            AlertCondition::Above,
            7.0,
            vec![
                RuleAction::enabled(ActionKind::NotifyClinician),
                RuleAction { kind: ActionKind::NotifyPatient, enabled: false },
            ],
        );
        store
            .with_conn(|conn| {
                db::insert_alert_rule(conn, &off)?;
                db::insert_alert_rule(conn, &on)
            })
            .unwrap();

        let alerts = evaluate_and_dispatch(&store, &engine, &p, 9.0, None);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, on.id);
        let kinds: Vec<ActionKind> = alerts[0].actions.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ActionKind::NotifyClinician]);
    }

    #[test]
    fn notification_failure_keeps_alert() {
        let (store, engine, p) = setup(Arc::new(FailingNotifier));
        let r = rule(
            p.id,
            AlertCondition::Above,
            7.0,
            vec![
                RuleAction::enabled(ActionKind::NotifyClinician),
                RuleAction::enabled(ActionKind::NotifyPatient),
            ],
        );
        store.with_conn(|conn| db::insert_alert_rule(conn, &r)).unwrap();

        let alerts = evaluate_and_dispatch(&store, &engine, &p, 8.0, None);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0]
            .actions
            .iter()
            .all(|a| matches!(a.outcome, ActionOutcome::AttemptedNotConfirmed { .. })));
        let stored = store.with_conn(|conn| db::get_alert(conn, &alerts[0].id)).unwrap().unwrap();
        assert_eq!(stored.actions.len(), 2);
    }

    #[test]
    fn clinician_and_patient_receive_different_copy() {
        let (notifier, mut rx) = ChannelNotifier::new(8);
        let (store, engine, p) = setup(Arc::new(notifier));
        let r = rule(
            p.id,
            AlertCondition::Above,
            7.0,
            vec![
                RuleAction::enabled(ActionKind::NotifyClinician),
                RuleAction::enabled(ActionKind::NotifyPatient),
            ],
        );
        store.with_conn(|conn| db::insert_alert_rule(conn, &r)).unwrap();
        evaluate_and_dispatch(&store, &engine, &p, 8.0, None);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.target_id, "dr-lee");
        assert_eq!(first.role, TargetRole::Clinician);
        assert_eq!(second.target_id, "pat-1");
        assert_eq!(second.role, TargetRole::Patient);
        assert_ne!(first.notification.message, second.notification.message);
        assert!(first.notification.message.contains("pat-1"));
    }

    #[test]
    fn missing_rule_alerts_once_per_silence() {
        let store = Arc::new(Store::in_memory("tenant-test").unwrap());
        let started = Utc::now() - chrono::Duration::hours(3);
        let p = program(started);
        store.with_conn(|conn| db::insert_program(conn, &p)).unwrap();
        let engine = RuleEngine::new(store.clone(), Arc::new(LogNotifier));
        let r = rule(p.id, AlertCondition::Missing, 60.0, vec![RuleAction::enabled(ActionKind::NotifyPatient)]);
        store.with_conn(|conn| db::insert_alert_rule(conn, &r)).unwrap();

        let now = Utc::now();
        let first = engine.sweep_missing(&p, now).unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].measurement_id.is_none());
        assert!(engine.sweep_missing(&p, now + chrono::Duration::minutes(5)).unwrap().is_empty());

        // A fresh measurement opens a new silence window.
        let mut m = measurement(p.id, 3.0);
        m.captured_at = now + chrono::Duration::minutes(10);
        store.with_conn(|conn| db::insert_measurement(conn, &m)).unwrap();
        assert!(engine.sweep_missing(&p, now + chrono::Duration::minutes(30)).unwrap().is_empty());
        let again = engine.sweep_missing(&p, now + chrono::Duration::minutes(75)).unwrap();
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn silence_window_bounds() {
        assert_eq!(silence_window(60.0), Some(chrono::Duration::hours(1)));
        assert_eq!(silence_window(MAX_MISSING_MINUTES), Some(chrono::Duration::days(365)));
        assert!(silence_window(0.0).is_none());
        assert!(silence_window(-5.0).is_none());
        assert!(silence_window(1e15).is_none());
        assert!(silence_window(f64::NAN).is_none());
    }

    #[test]
    fn oversized_missing_threshold_is_skipped_without_poisoning_store() {
        let store = Arc::new(Store::in_memory("tenant-test").unwrap());
        let p = program(Utc::now() - chrono::Duration::hours(3));
        store.with_conn(|conn| db::insert_program(conn, &p)).unwrap();
        let engine = RuleEngine::new(store.clone(), Arc::new(LogNotifier));
        let huge = rule(p.id, AlertCondition::Missing, 1e15, vec![]);
        let normal = rule(p.id, AlertCondition::Missing, 60.0, vec![]);
        store
            .with_conn(|conn| {
                db::insert_alert_rule(conn, &huge)?;
                db::insert_alert_rule(conn, &normal)
            })
            .unwrap();

        let alerts = engine.sweep_missing(&p, Utc::now()).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, normal.id);
        // The store stays usable after the sweep.
        assert_eq!(store.with_conn(|conn| db::get_alerts_by_program(conn, &p.id)).unwrap().len(), 1);
    }
}
