use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{parse_json, parse_uuid};
use crate::db::DatabaseError;
use crate::models::*;

const PRESCRIPTION_COLUMNS: &str = "id, session_id, prescription_type, name, dosage, frequency,
    duration_days, instructions, warnings, signature, signed_by, issued_at, expires_at,
    doses_taken, doses_missed, last_adherence_at, status";

/// Insert a signed prescription.
pub fn insert_prescription(conn: &Connection, p: &TelePrescription) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO prescriptions ({PRESCRIPTION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        ),
        params![
            p.id.to_string(),
            p.session_id.to_string(),
            p.prescription_type.as_str(),
            p.name,
            p.dosage,
            p.frequency,
            p.duration_days,
            p.instructions,
            serde_json::to_string(&p.warnings)?,
            p.signature,
            p.signed_by,
            p.issued_at,
            p.expires_at,
            p.doses_taken,
            p.doses_missed,
            p.last_adherence_at,
            p.status.as_str(),
        ],
    )?;
    Ok(())
}

pub fn get_prescription(conn: &Connection, id: &Uuid) -> Result<Option<TelePrescription>, DatabaseError> {
    let raw = conn
        .query_row(
            &format!("SELECT {PRESCRIPTION_COLUMNS} FROM prescriptions WHERE id = ?1"),
            params![id.to_string()],
            PrescriptionRow::from_row,
        )
        .optional()?;
    raw.map(PrescriptionRow::into_prescription).transpose()
}

/// All prescriptions issued in a session, in issue order.
pub fn get_prescriptions_by_session(
    conn: &Connection,
    session_id: &Uuid,
) -> Result<Vec<TelePrescription>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PRESCRIPTION_COLUMNS} FROM prescriptions
         WHERE session_id = ?1
         ORDER BY issued_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map(params![session_id.to_string()], PrescriptionRow::from_row)?;
    rows.map(|r| r.map_err(DatabaseError::from).and_then(PrescriptionRow::into_prescription))
        .collect()
}

/// Active prescriptions whose expiry has passed.
pub fn get_expired_active_prescriptions(
    conn: &Connection,
    now: DateTime<Utc>,
) -> Result<Vec<TelePrescription>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PRESCRIPTION_COLUMNS} FROM prescriptions
         WHERE status = 'active' AND expires_at <= ?1"
    ))?;
    let rows = stmt.query_map(params![now], PrescriptionRow::from_row)?;
    rows.map(|r| r.map_err(DatabaseError::from).and_then(PrescriptionRow::into_prescription))
        .collect()
}

/// Increment the adherence counters reported by the adherence tracker.
pub fn record_prescription_adherence(
    conn: &Connection,
    id: &Uuid,
    taken: bool,
    at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let (taken_inc, missed_inc) = if taken { (1, 0) } else { (0, 1) };
    let affected = conn.execute(
        "UPDATE prescriptions
         SET doses_taken = doses_taken + ?2, doses_missed = doses_missed + ?3, last_adherence_at = ?4
         WHERE id = ?1 AND status = 'active'",
        params![id.to_string(), taken_inc, missed_inc, at],
    )?;
    if affected == 0 {
        return Err(DatabaseError::not_found("active prescription", id));
    }
    Ok(())
}

/// Supersede an active prescription. Prescriptions are never deleted.
pub fn supersede_prescription(
    conn: &Connection,
    id: &Uuid,
    status: PrescriptionStatus,
) -> Result<(), DatabaseError> {
    if status == PrescriptionStatus::Active {
        return Err(DatabaseError::ConstraintViolation(
            "a prescription can only be superseded by cancelled or expired".into(),
        ));
    }
    let affected = conn.execute(
        "UPDATE prescriptions SET status = ?2 WHERE id = ?1 AND status = 'active'",
        params![id.to_string(), status.as_str()],
    )?;
    if affected == 0 {
        return Err(DatabaseError::not_found("active prescription", id));
    }
    Ok(())
}

struct PrescriptionRow {
    id: String,
    session_id: String,
    prescription_type: String,
    name: String,
    dosage: String,
    frequency: String,
    duration_days: u32,
    instructions: String,
    warnings: String,
    signature: String,
    signed_by: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    doses_taken: u32,
    doses_missed: u32,
    last_adherence_at: Option<DateTime<Utc>>,
    status: String,
}

impl PrescriptionRow {
    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            prescription_type: row.get(2)?,
            name: row.get(3)?,
            dosage: row.get(4)?,
            frequency: row.get(5)?,
            duration_days: row.get(6)?,
            instructions: row.get(7)?,
            warnings: row.get(8)?,
            signature: row.get(9)?,
            signed_by: row.get(10)?,
            issued_at: row.get(11)?,
            expires_at: row.get(12)?,
            doses_taken: row.get(13)?,
            doses_missed: row.get(14)?,
            last_adherence_at: row.get(15)?,
            status: row.get(16)?,
        })
    }

    fn into_prescription(self) -> Result<TelePrescription, DatabaseError> {
        Ok(TelePrescription {
            id: parse_uuid(&self.id)?,
            session_id: parse_uuid(&self.session_id)?,
            prescription_type: PrescriptionType::from_str(&self.prescription_type)?,
            name: self.name,
            dosage: self.dosage,
            frequency: self.frequency,
            duration_days: self.duration_days,
            instructions: self.instructions,
            warnings: parse_json(&self.warnings)?,
            signature: self.signature,
            signed_by: self.signed_by,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            doses_taken: self.doses_taken,
            doses_missed: self.doses_missed,
            last_adherence_at: self.last_adherence_at,
            status: PrescriptionStatus::from_str(&self.status)?,
        })
    }
}
