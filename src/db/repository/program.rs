use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{parse_json, parse_uuid};
use crate::db::DatabaseError;
use crate::models::*;

const PROGRAM_COLUMNS: &str = "id, patient_id, clinician_id, program_type, sampling_minutes,
    duration_days, started_at, status, insights, created_at, updated_at";

pub fn insert_program(conn: &Connection, p: &MonitoringProgram) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO programs ({PROGRAM_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            p.id.to_string(),
            p.patient_id,
            p.clinician_id,
            p.program_type.as_str(),
            p.sampling_minutes,
            p.duration_days,
            p.started_at,
            p.status.as_str(),
            serde_json::to_string(&p.insights)?,
            p.created_at,
            p.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_program(conn: &Connection, id: &Uuid) -> Result<Option<MonitoringProgram>, DatabaseError> {
    let raw = conn
        .query_row(
            &format!("SELECT {PROGRAM_COLUMNS} FROM programs WHERE id = ?1"),
            params![id.to_string()],
            ProgramRow::from_row,
        )
        .optional()?;
    raw.map(ProgramRow::into_program).transpose()
}

pub fn list_programs_by_status(
    conn: &Connection,
    status: ProgramStatus,
) -> Result<Vec<MonitoringProgram>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROGRAM_COLUMNS} FROM programs WHERE status = ?1 ORDER BY started_at ASC"
    ))?;
    let rows = stmt.query_map(params![status.as_str()], ProgramRow::from_row)?;
    rows.map(|r| r.map_err(DatabaseError::from).and_then(ProgramRow::into_program))
        .collect()
}

pub fn list_programs_by_patient(
    conn: &Connection,
    patient_id: &str,
) -> Result<Vec<MonitoringProgram>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROGRAM_COLUMNS} FROM programs WHERE patient_id = ?1 ORDER BY started_at DESC"
    ))?;
    let rows = stmt.query_map(params![patient_id], ProgramRow::from_row)?;
    rows.map(|r| r.map_err(DatabaseError::from).and_then(ProgramRow::into_program))
        .collect()
}

/// Change program status, guarded by the currently stored status.
/// Returns `false` when the stored status differed from `expected`.
pub fn update_program_status(
    conn: &Connection,
    id: &Uuid,
    expected: ProgramStatus,
    status: ProgramStatus,
) -> Result<bool, DatabaseError> {
    let affected = conn.execute(
        "UPDATE programs SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
        params![id.to_string(), status.as_str(), Utc::now(), expected.as_str()],
    )?;
    Ok(affected == 1)
}

pub fn update_program_insights(
    conn: &Connection,
    id: &Uuid,
    insights: &[ParameterInsight],
) -> Result<(), DatabaseError> {
    let affected = conn.execute(
        "UPDATE programs SET insights = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), serde_json::to_string(insights)?, Utc::now()],
    )?;
    if affected == 0 {
        return Err(DatabaseError::not_found("program", id));
    }
    Ok(())
}

struct ProgramRow {
    id: String,
    patient_id: String,
    clinician_id: String,
    program_type: String,
    sampling_minutes: u32,
    duration_days: u32,
    started_at: DateTime<Utc>,
    status: String,
    insights: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProgramRow {
    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            clinician_id: row.get(2)?,
            program_type: row.get(3)?,
            sampling_minutes: row.get(4)?,
            duration_days: row.get(5)?,
            started_at: row.get(6)?,
            status: row.get(7)?,
            insights: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_program(self) -> Result<MonitoringProgram, DatabaseError> {
        Ok(MonitoringProgram {
            id: parse_uuid(&self.id)?,
            patient_id: self.patient_id,
            clinician_id: self.clinician_id,
            program_type: ProgramType::from_str(&self.program_type)?,
            sampling_minutes: self.sampling_minutes,
            duration_days: self.duration_days,
            started_at: self.started_at,
            status: ProgramStatus::from_str(&self.status)?,
            insights: parse_json(&self.insights)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
