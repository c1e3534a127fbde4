use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{
    ActionKind, AlertCondition, AlertSeverity, AlertStatus, Connectivity, ProgramStatus,
    ProgramType, Reliability,
};

/// A standing enrollment collecting periodic measurements from a patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringProgram {
    pub id: Uuid,
    pub patient_id: String,
    pub clinician_id: String,
    pub program_type: ProgramType,
    /// Expected minutes between measurements.
    pub sampling_minutes: u32,
    pub duration_days: u32,
    pub started_at: DateTime<Utc>,
    pub status: ProgramStatus,
    /// Derived trend summaries; recomputed, never authoritative.
    pub insights: Vec<ParameterInsight>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MonitoringProgram {
    pub fn ends_at(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::days(i64::from(self.duration_days))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.ends_at()
    }
}

/// Request to enroll a patient in a monitoring program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProgram {
    pub patient_id: String,
    pub clinician_id: String,
    pub program_type: ProgramType,
    pub sampling_minutes: u32,
    pub duration_days: u32,
}

/// A measurement device attached to a monitoring program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedDevice {
    pub id: Uuid,
    pub program_id: Uuid,
    pub name: String,
    pub kind: String,
    pub connectivity: Connectivity,
    pub last_sync: Option<DateTime<Utc>>,
    /// Parameters this device is able to measure. Empty means unrestricted.
    pub parameters: Vec<String>,
}

impl ConnectedDevice {
    pub fn measures(&self, parameter: &str) -> bool {
        self.parameters.is_empty() || self.parameters.iter().any(|p| p == parameter)
    }
}

/// Device declaration supplied at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDevice {
    pub name: String,
    pub kind: String,
    pub parameters: Vec<String>,
}

/// Raw telemetry sample pushed by a device or mobile agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementInput {
    pub device_id: Option<Uuid>,
    pub parameter: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub reliability: Reliability,
}

/// A processed measurement. `is_anomaly`, `needs_review` and `z_score` are
/// computed during ingestion and never supplied by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringMeasurement {
    pub id: Uuid,
    pub program_id: Uuid,
    pub device_id: Option<Uuid>,
    pub parameter: String,
    pub value: f64,
    pub unit: String,
    pub captured_at: DateTime<Utc>,
    pub reliability: Reliability,
    pub is_anomaly: bool,
    pub needs_review: bool,
    pub z_score: Option<f64>,
}

/// One action attached to a rule. Disabled actions are skipped on trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAction {
    pub kind: ActionKind,
    pub enabled: bool,
}

impl RuleAction {
    pub fn enabled(kind: ActionKind) -> Self {
        Self { kind, enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub program_id: Uuid,
    pub parameter: String,
    pub condition: AlertCondition,
    /// For `missing`, the silence window in minutes.
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub enabled: bool,
    pub actions: Vec<RuleAction>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAlertRule {
    pub parameter: String,
    pub condition: AlertCondition,
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub actions: Vec<RuleAction>,
}

/// Outcome of a single notification action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Delivered,
    AttemptedNotConfirmed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedAction {
    pub kind: ActionKind,
    #[serde(flatten)]
    pub outcome: ActionOutcome,
    pub executed_at: DateTime<Utc>,
}

/// Alert materialized from a rule match. Append-only except `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringAlert {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub program_id: Uuid,
    /// `None` for alerts raised by the missing-data sweep.
    pub measurement_id: Option<Uuid>,
    pub parameter: String,
    pub value: Option<f64>,
    pub message: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub actions: Vec<ExecutedAction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

/// Per-parameter summary derived from a program's measurement history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterInsight {
    pub parameter: String,
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub latest: f64,
    pub anomaly_count: usize,
    pub trend: Trend,
}
