use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{parse_json, parse_uuid};
use crate::db::DatabaseError;
use crate::models::*;

pub fn insert_device(conn: &Connection, d: &ConnectedDevice) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO devices (id, program_id, name, kind, connectivity, last_sync, parameters)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            d.id.to_string(),
            d.program_id.to_string(),
            d.name,
            d.kind,
            d.connectivity.as_str(),
            d.last_sync,
            serde_json::to_string(&d.parameters)?,
        ],
    )?;
    Ok(())
}

pub fn get_device(conn: &Connection, id: &Uuid) -> Result<Option<ConnectedDevice>, DatabaseError> {
    let raw = conn
        .query_row(
            "SELECT id, program_id, name, kind, connectivity, last_sync, parameters
             FROM devices WHERE id = ?1",
            params![id.to_string()],
            row_to_raw,
        )
        .optional()?;
    raw.map(raw_to_device).transpose()
}

pub fn list_devices_by_program(
    conn: &Connection,
    program_id: &Uuid,
) -> Result<Vec<ConnectedDevice>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, program_id, name, kind, connectivity, last_sync, parameters
         FROM devices WHERE program_id = ?1 ORDER BY rowid ASC",
    )?;
    let rows = stmt.query_map(params![program_id.to_string()], row_to_raw)?;
    rows.map(|r| r.map_err(DatabaseError::from).and_then(raw_to_device))
        .collect()
}

/// Update connectivity and last sync time.
pub fn update_device_connectivity(
    conn: &Connection,
    id: &Uuid,
    connectivity: Connectivity,
    last_sync: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let affected = conn.execute(
        "UPDATE devices SET connectivity = ?2, last_sync = ?3 WHERE id = ?1",
        params![id.to_string(), connectivity.as_str(), last_sync],
    )?;
    if affected == 0 {
        return Err(DatabaseError::not_found("device", id));
    }
    Ok(())
}

/// Update last sync time only.
pub fn touch_device(conn: &Connection, id: &Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
    let affected = conn.execute(
        "UPDATE devices SET last_sync = ?2 WHERE id = ?1",
        params![id.to_string(), at],
    )?;
    if affected == 0 {
        return Err(DatabaseError::not_found("device", id));
    }
    Ok(())
}

type RawDevice = (String, String, String, String, String, Option<DateTime<Utc>>, String);

fn row_to_raw(row: &rusqlite::Row) -> Result<RawDevice, rusqlite::Error> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn raw_to_device(raw: RawDevice) -> Result<ConnectedDevice, DatabaseError> {
    let (id, program_id, name, kind, connectivity, last_sync, parameters) = raw;
    Ok(ConnectedDevice {
        id: parse_uuid(&id)?,
        program_id: parse_uuid(&program_id)?,
        name,
        kind,
        connectivity: Connectivity::from_str(&connectivity)?,
        last_sync,
        parameters: parse_json(&parameters)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::insert_program;
    use crate::db::repository::program::tests::make_program;
    use crate::db::sqlite::open_memory_database;

    fn make_device(program_id: Uuid) -> ConnectedDevice {
        ConnectedDevice {
            id: Uuid::new_v4(),
            program_id,
            name: "Cuff".into(),
            kind: "blood_pressure_monitor".into(),
            connectivity: Connectivity::Disconnected,
            last_sync: None,
            parameters: vec!["systolic".into(), "diastolic".into()],
        }
    }

    #[test]
    fn insert_and_update_connectivity() {
        let conn = open_memory_database().unwrap();
        let p = make_program("pat-1");
        insert_program(&conn, &p).unwrap();
        let d = make_device(p.id);
        insert_device(&conn, &d).unwrap();

        let now = Utc::now();
        update_device_connectivity(&conn, &d.id, Connectivity::Connected, now).unwrap();
        let loaded = get_device(&conn, &d.id).unwrap().unwrap();
        assert_eq!(loaded.connectivity, Connectivity::Connected);
        assert_eq!(loaded.last_sync, Some(now));
        assert_eq!(loaded.parameters.len(), 2);
    }

    #[test]
    fn device_requires_existing_program() {
        let conn = open_memory_database().unwrap();
        let result = insert_device(&conn, &make_device(Uuid::new_v4()));
        assert!(result.is_err());
    }

    #[test]
    fn update_unknown_device_not_found() {
        let conn = open_memory_database().unwrap();
        let result = touch_device(&conn, &Uuid::new_v4(), Utc::now());
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
    }

    #[test]
    fn list_by_program() {
        let conn = open_memory_database().unwrap();
        let p = make_program("pat-1");
        insert_program(&conn, &p).unwrap();
        insert_device(&conn, &make_device(p.id)).unwrap();
        insert_device(&conn, &make_device(p.id)).unwrap();
        assert_eq!(list_devices_by_program(&conn, &p.id).unwrap().len(), 2);
    }
}
