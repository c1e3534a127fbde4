use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{parse_json, parse_opt_json, parse_uuid};
use crate::db::DatabaseError;
use crate::models::*;

const SESSION_COLUMNS: &str = "id, patient_id, clinician_id, session_type, status,
    scheduled_start, scheduled_end, actual_start, actual_end, duration_secs,
    consent_signed, consent_at, provider_name, room_id, connection_quality,
    vital_signs, vital_analysis, assessment, diagnoses, treatment_plan,
    follow_up_required, follow_up_date, cancellation_reason, billable, billed,
    created_at, updated_at";

/// Insert a newly scheduled session.
pub fn insert_session(conn: &Connection, s: &TeleconsultSession) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO sessions ({SESSION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)"
        ),
        params![
            s.id.to_string(),
            s.patient_id,
            s.clinician_id,
            s.session_type.as_str(),
            s.status.as_str(),
            s.scheduled_start,
            s.scheduled_end,
            s.actual_start,
            s.actual_end,
            s.duration_secs,
            s.consent_signed,
            s.consent_at,
            s.provider_name,
            s.room_id,
            s.connection_quality.as_ref().map(serde_json::to_string).transpose()?,
            s.vital_signs.as_ref().map(serde_json::to_string).transpose()?,
            s.vital_analysis.as_ref().map(serde_json::to_string).transpose()?,
            s.assessment,
            serde_json::to_string(&s.diagnoses)?,
            s.treatment_plan,
            s.follow_up_required,
            s.follow_up_date,
            s.cancellation_reason,
            s.billable,
            s.billed,
            s.created_at,
            s.updated_at,
        ],
    )?;
    Ok(())
}

/// Get a session by ID.
pub fn get_session(conn: &Connection, id: &Uuid) -> Result<Option<TeleconsultSession>, DatabaseError> {
    let raw = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![id.to_string()],
            SessionRow::from_row,
        )
        .optional()?;
    raw.map(SessionRow::into_session).transpose()
}

/// Persist a transition. The row is only written when its stored status still
/// equals `expected`, so two racing transitions cannot both succeed.
///
/// Returns `false` when the status check failed and nothing was written.
pub fn update_session(
    conn: &Connection,
    s: &TeleconsultSession,
    expected: SessionStatus,
) -> Result<bool, DatabaseError> {
    let affected = conn.execute(
        "UPDATE sessions SET
            status = ?2, actual_start = ?3, actual_end = ?4, duration_secs = ?5,
            consent_signed = ?6, consent_at = ?7, provider_name = ?8, room_id = ?9,
            connection_quality = ?10, vital_signs = ?11, vital_analysis = ?12,
            assessment = ?13, diagnoses = ?14, treatment_plan = ?15,
            follow_up_required = ?16, follow_up_date = ?17, cancellation_reason = ?18,
            billable = ?19, billed = ?20, updated_at = ?21
         WHERE id = ?1 AND status = ?22",
        params![
            s.id.to_string(),
            s.status.as_str(),
            s.actual_start,
            s.actual_end,
            s.duration_secs,
            s.consent_signed,
            s.consent_at,
            s.provider_name,
            s.room_id,
            s.connection_quality.as_ref().map(serde_json::to_string).transpose()?,
            s.vital_signs.as_ref().map(serde_json::to_string).transpose()?,
            s.vital_analysis.as_ref().map(serde_json::to_string).transpose()?,
            s.assessment,
            serde_json::to_string(&s.diagnoses)?,
            s.treatment_plan,
            s.follow_up_required,
            s.follow_up_date,
            s.cancellation_reason,
            s.billable,
            s.billed,
            s.updated_at,
            expected.as_str(),
        ],
    )?;
    Ok(affected == 1)
}

/// Store a connection-quality sample. Only applies while the session is in progress.
pub fn update_session_quality(
    conn: &Connection,
    id: &Uuid,
    snapshot: &QualitySnapshot,
) -> Result<bool, DatabaseError> {
    let affected = conn.execute(
        "UPDATE sessions SET connection_quality = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'in_progress'",
        params![id.to_string(), serde_json::to_string(snapshot)?, snapshot.sampled_at],
    )?;
    Ok(affected == 1)
}

/// Post-hoc billing flag; allowed in any state.
pub fn update_session_billed(conn: &Connection, id: &Uuid, billed: bool) -> Result<(), DatabaseError> {
    let affected = conn.execute(
        "UPDATE sessions SET billed = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), billed, Utc::now()],
    )?;
    if affected == 0 {
        return Err(DatabaseError::not_found("session", id));
    }
    Ok(())
}

/// Sessions for a patient, most recent schedule first.
pub fn list_sessions_by_patient(
    conn: &Connection,
    patient_id: &str,
) -> Result<Vec<TeleconsultSession>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions
         WHERE patient_id = ?1
         ORDER BY scheduled_start DESC"
    ))?;
    let rows = stmt.query_map(params![patient_id], SessionRow::from_row)?;
    rows.map(|r| r.map_err(DatabaseError::from).and_then(SessionRow::into_session))
        .collect()
}

/// Sessions in a given status, earliest schedule first.
pub fn list_sessions_by_status(
    conn: &Connection,
    status: SessionStatus,
) -> Result<Vec<TeleconsultSession>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions
         WHERE status = ?1
         ORDER BY scheduled_start ASC"
    ))?;
    let rows = stmt.query_map(params![status.as_str()], SessionRow::from_row)?;
    rows.map(|r| r.map_err(DatabaseError::from).and_then(SessionRow::into_session))
        .collect()
}

/// Raw column values; enum and JSON parsing happens in `into_session` so
/// conversion errors surface as `DatabaseError`.
struct SessionRow {
    id: String,
    patient_id: String,
    clinician_id: String,
    session_type: String,
    status: String,
    scheduled_start: DateTime<Utc>,
    scheduled_end: DateTime<Utc>,
    actual_start: Option<DateTime<Utc>>,
    actual_end: Option<DateTime<Utc>>,
    duration_secs: Option<i64>,
    consent_signed: bool,
    consent_at: Option<DateTime<Utc>>,
    provider_name: Option<String>,
    room_id: Option<String>,
    connection_quality: Option<String>,
    vital_signs: Option<String>,
    vital_analysis: Option<String>,
    assessment: Option<String>,
    diagnoses: String,
    treatment_plan: Option<String>,
    follow_up_required: bool,
    follow_up_date: Option<NaiveDate>,
    cancellation_reason: Option<String>,
    billable: bool,
    billed: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            clinician_id: row.get(2)?,
            session_type: row.get(3)?,
            status: row.get(4)?,
            scheduled_start: row.get(5)?,
            scheduled_end: row.get(6)?,
            actual_start: row.get(7)?,
            actual_end: row.get(8)?,
            duration_secs: row.get(9)?,
            consent_signed: row.get(10)?,
            consent_at: row.get(11)?,
            provider_name: row.get(12)?,
            room_id: row.get(13)?,
            connection_quality: row.get(14)?,
            vital_signs: row.get(15)?,
            vital_analysis: row.get(16)?,
            assessment: row.get(17)?,
            diagnoses: row.get(18)?,
            treatment_plan: row.get(19)?,
            follow_up_required: row.get(20)?,
            follow_up_date: row.get(21)?,
            cancellation_reason: row.get(22)?,
            billable: row.get(23)?,
            billed: row.get(24)?,
            created_at: row.get(25)?,
            updated_at: row.get(26)?,
        })
    }

    fn into_session(self) -> Result<TeleconsultSession, DatabaseError> {
        Ok(TeleconsultSession {
            id: parse_uuid(&self.id)?,
            patient_id: self.patient_id,
            clinician_id: self.clinician_id,
            session_type: SessionType::from_str(&self.session_type)?,
            status: SessionStatus::from_str(&self.status)?,
            scheduled_start: self.scheduled_start,
            scheduled_end: self.scheduled_end,
            actual_start: self.actual_start,
            actual_end: self.actual_end,
            duration_secs: self.duration_secs,
            consent_signed: self.consent_signed,
            consent_at: self.consent_at,
            provider_name: self.provider_name,
            room_id: self.room_id,
            connection_quality: parse_opt_json(self.connection_quality)?,
            vital_signs: parse_opt_json(self.vital_signs)?,
            vital_analysis: parse_opt_json(self.vital_analysis)?,
            assessment: self.assessment,
            diagnoses: parse_json(&self.diagnoses)?,
            treatment_plan: self.treatment_plan,
            follow_up_required: self.follow_up_required,
            follow_up_date: self.follow_up_date,
            cancellation_reason: self.cancellation_reason,
            billable: self.billable,
            billed: self.billed,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
