//! Device registry for remote monitoring programs.
//!
//! Owns the connectivity state of devices attached to a program.
//! Device lifecycle: REGISTERED (disconnected) → CONNECTED ⇄ DISCONNECTED.
//! Every mark updates `last_sync`. Unknown devices are always `NotFound`.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::db::{self, DatabaseError, Store};
use crate::models::{ConnectedDevice, Connectivity, NewDevice};

// ═══════════════════════════════════════════════════════════
// Error type
// ═══════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(Uuid),
    #[error("Program not found: {0}")]
    ProgramNotFound(Uuid),
    #[error("Invalid device: {0}")]
    Validation(String),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

// ═══════════════════════════════════════════════════════════
// DeviceRegistry
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    store: Arc<Store>,
}

impl DeviceRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Attach a new device to a program. Devices start disconnected.
    pub fn register_device(
        &self,
        program_id: Uuid,
        device: NewDevice,
    ) -> Result<ConnectedDevice, DeviceError> {
        if device.name.trim().is_empty() {
            return Err(DeviceError::Validation("device name is required".into()));
        }
        if device.parameters.iter().any(|p| p.trim().is_empty()) {
            return Err(DeviceError::Validation("declared parameters must be non-empty".into()));
        }

        let registered = ConnectedDevice {
            id: Uuid::new_v4(),
            program_id,
            name: device.name,
            kind: device.kind,
            connectivity: Connectivity::Disconnected,
            last_sync: None,
            parameters: device.parameters,
        };

        self.store.with_tx(|tx| {
            if db::get_program(tx, &program_id)?.is_none() {
                return Err(DeviceError::ProgramNotFound(program_id));
            }
            db::insert_device(tx, &registered)?;
            Ok(())
        })?;

        tracing::info!(
            device_id = %registered.id,
            program_id = %program_id,
            kind = %registered.kind,
            "Device registered"
        );
        Ok(registered)
    }

    pub fn mark_connected(&self, device_id: &Uuid) -> Result<ConnectedDevice, DeviceError> {
        self.set_connectivity(device_id, Connectivity::Connected)
    }

    pub fn mark_disconnected(&self, device_id: &Uuid) -> Result<ConnectedDevice, DeviceError> {
        self.set_connectivity(device_id, Connectivity::Disconnected)
    }

    /// Record that a device pushed data. Updates `last_sync` only.
    pub fn touch(&self, device_id: &Uuid) -> Result<(), DeviceError> {
        let now = Utc::now();
        self.store.with_conn(|conn| {
            db::touch_device(conn, device_id, now).map_err(|e| not_found_as_device(e, device_id))
        })
    }

    pub fn get(&self, device_id: &Uuid) -> Result<ConnectedDevice, DeviceError> {
        self.store
            .with_conn(|conn| db::get_device(conn, device_id).map_err(DeviceError::from))?
            .ok_or(DeviceError::NotFound(*device_id))
    }

    pub fn list(&self, program_id: &Uuid) -> Result<Vec<ConnectedDevice>, DeviceError> {
        self.store
            .with_conn(|conn| db::list_devices_by_program(conn, program_id).map_err(DeviceError::from))
    }

    fn set_connectivity(
        &self,
        device_id: &Uuid,
        connectivity: Connectivity,
    ) -> Result<ConnectedDevice, DeviceError> {
        let now = Utc::now();
        let device = self.store.with_tx(|tx| {
            db::update_device_connectivity(tx, device_id, connectivity, now)
                .map_err(|e| not_found_as_device(e, device_id))?;
            db::get_device(tx, device_id)?.ok_or(DeviceError::NotFound(*device_id))
        })?;
        tracing::info!(device_id = %device_id, connectivity = %connectivity, "Device connectivity changed");
        Ok(device)
    }
}

fn not_found_as_device(err: DatabaseError, device_id: &Uuid) -> DeviceError {
    match err {
        DatabaseError::NotFound { .. } => DeviceError::NotFound(*device_id),
        other => DeviceError::Database(other),
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
