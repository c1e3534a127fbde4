use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{
    ConnectionGrade, PrescriptionStatus, PrescriptionType, SessionStatus, SessionType,
};
use super::vital_sign::{VitalAnalysis, VitalSigns};

/// A scheduled remote clinical encounter between one patient and one clinician.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeleconsultSession {
    pub id: Uuid,
    pub patient_id: String,
    pub clinician_id: String,
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub consent_signed: bool,
    pub consent_at: Option<DateTime<Utc>>,
    /// Media provider chosen when the session started.
    pub provider_name: Option<String>,
    pub room_id: Option<String>,
    pub connection_quality: Option<QualitySnapshot>,
    pub vital_signs: Option<VitalSigns>,
    pub vital_analysis: Option<VitalAnalysis>,
    pub assessment: Option<String>,
    pub diagnoses: Vec<String>,
    pub treatment_plan: Option<String>,
    pub follow_up_required: bool,
    pub follow_up_date: Option<NaiveDate>,
    pub cancellation_reason: Option<String>,
    pub billable: bool,
    pub billed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to schedule a new session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSession {
    pub patient_id: String,
    pub clinician_id: String,
    pub session_type: SessionType,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub billable: bool,
}

/// Clinical close-out supplied by the clinician when ending a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClinicalSummary {
    pub assessment: String,
    pub diagnoses: Vec<String>,
    pub treatment_plan: String,
    pub prescriptions: Vec<PrescriptionRequest>,
    pub follow_up_required: bool,
    pub follow_up_date: Option<NaiveDate>,
}

/// One prescription entry requested at close-out, before signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrescriptionRequest {
    pub prescription_type: PrescriptionType,
    pub name: String,
    pub dosage: String,
    pub frequency: String,
    pub duration_days: u32,
    pub instructions: String,
    pub warnings: Vec<String>,
}

/// A signed prescription issued during session close-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelePrescription {
    pub id: Uuid,
    pub session_id: Uuid,
    pub prescription_type: PrescriptionType,
    pub name: String,
    pub dosage: String,
    pub frequency: String,
    pub duration_days: u32,
    pub instructions: String,
    pub warnings: Vec<String>,
    pub signature: String,
    pub signed_by: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub doses_taken: u32,
    pub doses_missed: u32,
    pub last_adherence_at: Option<DateTime<Utc>>,
    pub status: PrescriptionStatus,
}

impl TelePrescription {
    /// Canonical bytes covered by the prescription signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.session_id,
            self.prescription_type,
            self.name,
            self.dosage,
            self.frequency,
            self.duration_days,
            self.instructions,
            self.issued_at.to_rfc3339(),
        )
        .into_bytes()
    }
}

/// Connection quality sampled while a session is in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySnapshot {
    pub patient_connection: ConnectionGrade,
    pub clinician_connection: ConnectionGrade,
    pub average_latency_ms: f64,
    pub packet_loss_pct: f64,
    pub resolution: String,
    pub bandwidth_kbps: u32,
    pub sampled_at: DateTime<Utc>,
}
