use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{parse_json, parse_opt_uuid, parse_uuid};
use crate::db::DatabaseError;
use crate::models::*;

const ALERT_COLUMNS: &str = "id, rule_id, program_id, measurement_id, parameter, value, message,
    severity, status, actions, created_at, updated_at";

/// Append an alert. Alerts are never deleted.
pub fn insert_alert(conn: &Connection, a: &MonitoringAlert) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO alerts ({ALERT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            a.id.to_string(),
            a.rule_id.to_string(),
            a.program_id.to_string(),
            a.measurement_id.map(|m| m.to_string()),
            a.parameter,
            a.value,
            a.message,
            a.severity.as_str(),
            a.status.as_str(),
            serde_json::to_string(&a.actions)?,
            a.created_at,
            a.updated_at,
        ],
    )?;
    Ok(())
}

/// Record the actions executed for an alert. Allowed once per alert.
pub fn record_alert_actions(
    conn: &Connection,
    id: &Uuid,
    actions: &[ExecutedAction],
) -> Result<(), DatabaseError> {
    let affected = conn.execute(
        "UPDATE alerts SET actions = ?2 WHERE id = ?1",
        params![id.to_string(), serde_json::to_string(actions)?],
    )?;
    if affected == 0 {
        return Err(DatabaseError::not_found("alert", id));
    }
    Ok(())
}

/// Status transition made by a human reviewer.
pub fn update_alert_status(
    conn: &Connection,
    id: &Uuid,
    expected: AlertStatus,
    status: AlertStatus,
) -> Result<bool, DatabaseError> {
    let affected = conn.execute(
        "UPDATE alerts SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
        params![id.to_string(), status.as_str(), Utc::now(), expected.as_str()],
    )?;
    Ok(affected == 1)
}

pub fn get_alert(conn: &Connection, id: &Uuid) -> Result<Option<MonitoringAlert>, DatabaseError> {
    let raw = conn
        .query_row(
            &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
            params![id.to_string()],
            AlertRow::from_row,
        )
        .optional()?;
    raw.map(AlertRow::into_alert).transpose()
}

/// All alerts for a program in creation order.
pub fn get_alerts_by_program(conn: &Connection, program_id: &Uuid) -> Result<Vec<MonitoringAlert>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ALERT_COLUMNS} FROM alerts WHERE program_id = ?1 ORDER BY seq ASC"
    ))?;
    let rows = stmt.query_map(params![program_id.to_string()], AlertRow::from_row)?;
    rows.map(|r| r.map_err(DatabaseError::from).and_then(AlertRow::into_alert))
        .collect()
}

/// Alerts that reference a given measurement.
pub fn get_alerts_by_measurement(
    conn: &Connection,
    measurement_id: &Uuid,
) -> Result<Vec<MonitoringAlert>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ALERT_COLUMNS} FROM alerts WHERE measurement_id = ?1 ORDER BY seq ASC"
    ))?;
    let rows = stmt.query_map(params![measurement_id.to_string()], AlertRow::from_row)?;
    rows.map(|r| r.map_err(DatabaseError::from).and_then(AlertRow::into_alert))
        .collect()
}

/// Creation time of the latest alert raised by a rule.
pub fn get_last_alert_time_for_rule(
    conn: &Connection,
    rule_id: &Uuid,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    let latest = conn.query_row(
        "SELECT MAX(created_at) FROM alerts WHERE rule_id = ?1",
        params![rule_id.to_string()],
        |row| row.get::<_, Option<DateTime<Utc>>>(0),
    )?;
    Ok(latest)
}

struct AlertRow {
    id: String,
    rule_id: String,
    program_id: String,
    measurement_id: Option<String>,
    parameter: String,
    value: Option<f64>,
    message: String,
    severity: String,
    status: String,
    actions: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AlertRow {
    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            rule_id: row.get(1)?,
            program_id: row.get(2)?,
            measurement_id: row.get(3)?,
            parameter: row.get(4)?,
            value: row.get(5)?,
            message: row.get(6)?,
            severity: row.get(7)?,
            status: row.get(8)?,
            actions: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_alert(self) -> Result<MonitoringAlert, DatabaseError> {
        Ok(MonitoringAlert {
            id: parse_uuid(&self.id)?,
            rule_id: parse_uuid(&self.rule_id)?,
            program_id: parse_uuid(&self.program_id)?,
            measurement_id: parse_opt_uuid(self.measurement_id)?,
            parameter: self.parameter,
            value: self.value,
            message: self.message,
            severity: AlertSeverity::from_str(&self.severity)?,
            status: AlertStatus::from_str(&self.status)?,
            actions: parse_json(&self.actions)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::program::tests::make_program;
    use crate::db::repository::rule::tests::make_rule;
    use crate::db::repository::{insert_alert_rule, insert_program};
    use crate::db::sqlite::open_memory_database;

    fn setup() -> (Connection, MonitoringAlert) {
        let conn = open_memory_database().unwrap();
        let p = make_program("pat-1");
        insert_program(&conn, &p).unwrap();
        let r = make_rule(p.id, "pain_level", AlertCondition::Above, 7.0);
        insert_alert_rule(&conn, &r).unwrap();
        let now = Utc::now();
        let alert = MonitoringAlert {
            id: Uuid::new_v4(),
            rule_id: r.id,
            program_id: p.id,
            measurement_id: Some(Uuid::new_v4()),
            parameter: "pain_level".into(),
            value: Some(8.0),
            message: "pain_level above 7".into(),
            severity: AlertSeverity::High,
            status: AlertStatus::Active,
            actions: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        insert_alert(&conn, &alert).unwrap();
        (conn, alert)
    }

    #[test]
    fn insert_and_retrieve_alert() {
        let (conn, alert) = setup();
        let loaded = get_alert(&conn, &alert.id).unwrap().unwrap();
        assert_eq!(loaded, alert);
        assert_eq!(get_alerts_by_program(&conn, &alert.program_id).unwrap().len(), 1);
    }

    #[test]
    fn actions_recorded_once() {
        let (conn, alert) = setup();
        let actions = vec![ExecutedAction {
            kind: ActionKind::NotifyClinician,
            outcome: ActionOutcome::Delivered,
            executed_at: Utc::now(),
        }];
        record_alert_actions(&conn, &alert.id, &actions).unwrap();
        assert_eq!(get_alert(&conn, &alert.id).unwrap().unwrap().actions, actions);

        assert!(record_alert_actions(&conn, &alert.id, &[]).is_err());
    }

    #[test]
    fn only_status_is_mutable() {
        let (conn, alert) = setup();
        assert!(update_alert_status(&conn, &alert.id, AlertStatus::Active, AlertStatus::Acknowledged).unwrap());
        assert!(!update_alert_status(&conn, &alert.id, AlertStatus::Active, AlertStatus::Resolved).unwrap());

        let message_edit = conn.execute(
            "UPDATE alerts SET message = 'edited' WHERE id = ?1",
            params![alert.id.to_string()],
        );
        assert!(message_edit.is_err());
        let delete = conn.execute("DELETE FROM alerts WHERE id = ?1", params![alert.id.to_string()]);
        assert!(delete.is_err());
    }

    #[test]
    fn last_alert_time_for_rule() {
        let (conn, alert) = setup();
        assert_eq!(
            get_last_alert_time_for_rule(&conn, &alert.rule_id).unwrap(),
            Some(alert.created_at)
        );
        assert!(get_last_alert_time_for_rule(&conn, &Uuid::new_v4()).unwrap().is_none());
    }
}
