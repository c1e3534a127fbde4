use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{parse_json, parse_uuid};
use crate::db::DatabaseError;
use crate::models::*;

const RULE_COLUMNS: &str =
    "id, program_id, parameter, condition, threshold, severity, enabled, actions, created_at";

pub fn insert_alert_rule(conn: &Connection, r: &AlertRule) -> Result<(), DatabaseError> {
    conn.execute(
        &format!("INSERT INTO alert_rules ({RULE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            r.id.to_string(),
            r.program_id.to_string(),
            r.parameter,
            r.condition.as_str(),
            r.threshold,
            r.severity.as_str(),
            r.enabled,
            serde_json::to_string(&r.actions)?,
            r.created_at,
        ],
    )?;
    Ok(())
}

pub fn get_alert_rule(conn: &Connection, id: &Uuid) -> Result<Option<AlertRule>, DatabaseError> {
    let raw = conn
        .query_row(
            &format!("SELECT {RULE_COLUMNS} FROM alert_rules WHERE id = ?1"),
            params![id.to_string()],
            row_to_raw,
        )
        .optional()?;
    raw.map(raw_to_rule).transpose()
}

/// All rules for a program in creation order.
pub fn get_rules_by_program(conn: &Connection, program_id: &Uuid) -> Result<Vec<AlertRule>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RULE_COLUMNS} FROM alert_rules WHERE program_id = ?1 ORDER BY rowid ASC"
    ))?;
    let rows = stmt.query_map(params![program_id.to_string()], row_to_raw)?;
    rows.map(|r| r.map_err(DatabaseError::from).and_then(raw_to_rule))
        .collect()
}

pub fn set_alert_rule_enabled(conn: &Connection, id: &Uuid, enabled: bool) -> Result<(), DatabaseError> {
    let affected = conn.execute(
        "UPDATE alert_rules SET enabled = ?2 WHERE id = ?1",
        params![id.to_string(), enabled],
    )?;
    if affected == 0 {
        return Err(DatabaseError::not_found("alert_rule", id));
    }
    Ok(())
}

type RawRule = (String, String, String, String, f64, String, bool, String, DateTime<Utc>);

fn row_to_raw(row: &rusqlite::Row) -> Result<RawRule, rusqlite::Error> {
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
    ))
}

fn raw_to_rule(raw: RawRule) -> Result<AlertRule, DatabaseError> {
    let (id, program_id, parameter, condition, threshold, severity, enabled, actions, created_at) = raw;
    Ok(AlertRule {
        id: parse_uuid(&id)?,
        program_id: parse_uuid(&program_id)?,
        parameter,
        condition: AlertCondition::from_str(&condition)?,
        threshold,
        severity: AlertSeverity::from_str(&severity)?,
        enabled,
        actions: parse_json(&actions)?,
        created_at,
    })
}
