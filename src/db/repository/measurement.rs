use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{parse_opt_uuid, parse_uuid};
use crate::db::DatabaseError;
use crate::models::*;

const MEASUREMENT_COLUMNS: &str = "id, program_id, device_id, parameter, value, unit,
    captured_at, reliability, is_anomaly, needs_review, z_score";

/// Append a measurement to the durable log. The log is append-only.
pub fn insert_measurement(conn: &Connection, m: &MonitoringMeasurement) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO measurements ({MEASUREMENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            m.id.to_string(),
            m.program_id.to_string(),
            m.device_id.map(|d| d.to_string()),
            m.parameter,
            m.value,
            m.unit,
            m.captured_at,
            m.reliability.as_str(),
            m.is_anomaly,
            m.needs_review,
            m.z_score,
        ],
    )?;
    Ok(())
}

/// Most recent measurements for one parameter, returned oldest first.
pub fn get_recent_measurements(
    conn: &Connection,
    program_id: &Uuid,
    parameter: &str,
    limit: usize,
) -> Result<Vec<MonitoringMeasurement>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MEASUREMENT_COLUMNS} FROM (
            SELECT seq, {MEASUREMENT_COLUMNS} FROM measurements
            WHERE program_id = ?1 AND parameter = ?2
            ORDER BY seq DESC
            LIMIT ?3
         ) ORDER BY seq ASC"
    ))?;
    let rows = stmt.query_map(
        params![program_id.to_string(), parameter, limit as i64],
        row_to_raw,
    )?;
    rows.map(|r| r.map_err(DatabaseError::from).and_then(raw_to_measurement))
        .collect()
}

/// Full measurement log for a program in arrival order.
pub fn get_measurements_by_program(
    conn: &Connection,
    program_id: &Uuid,
) -> Result<Vec<MonitoringMeasurement>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MEASUREMENT_COLUMNS} FROM measurements
         WHERE program_id = ?1
         ORDER BY seq ASC"
    ))?;
    let rows = stmt.query_map(params![program_id.to_string()], row_to_raw)?;
    rows.map(|r| r.map_err(DatabaseError::from).and_then(raw_to_measurement))
        .collect()
}

/// Distinct parameters measured for a program.
pub fn get_program_parameters(conn: &Connection, program_id: &Uuid) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT parameter FROM measurements WHERE program_id = ?1 ORDER BY parameter",
    )?;
    let rows = stmt.query_map(params![program_id.to_string()], |row| row.get::<_, String>(0))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(DatabaseError::from)
}

/// Capture time of the latest measurement for a parameter.
pub fn get_last_measurement_time(
    conn: &Connection,
    program_id: &Uuid,
    parameter: &str,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    let latest = conn.query_row(
        "SELECT MAX(captured_at) FROM measurements WHERE program_id = ?1 AND parameter = ?2",
        params![program_id.to_string(), parameter],
        |row| row.get::<_, Option<DateTime<Utc>>>(0),
    )?;
    Ok(latest)
}

pub fn count_measurements(conn: &Connection, program_id: &Uuid) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM measurements WHERE program_id = ?1",
        params![program_id.to_string()],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count)
}

type RawMeasurement = (
    String,
    String,
    Option<String>,
    String,
    f64,
    String,
    DateTime<Utc>,
    String,
    bool,
    bool,
    Option<f64>,
);

fn row_to_raw(row: &rusqlite::Row) -> Result<RawMeasurement, rusqlite::Error> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn raw_to_measurement(raw: RawMeasurement) -> Result<MonitoringMeasurement, DatabaseError> {
    let (id, program_id, device_id, parameter, value, unit, captured_at, reliability, is_anomaly, needs_review, z_score) =
        raw;
    Ok(MonitoringMeasurement {
        id: parse_uuid(&id)?,
        program_id: parse_uuid(&program_id)?,
        device_id: parse_opt_uuid(device_id)?,
        parameter,
        value,
        unit,
        captured_at,
        reliability: Reliability::from_str(&reliability)?,
        is_anomaly,
        needs_review,
        z_score,
    })
}
