//! Tenant-scoped store, one SQLite database per tenant.
//!
//! Every component receives an `Arc<Store>` instead of reaching for a global
//! connection. The connection sits behind a `Mutex`; callers borrow it for the
//! duration of one repository call or one transaction.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, Transaction};

use super::sqlite::{open_database, open_memory_database};
use super::DatabaseError;
use crate::config;

pub struct Store {
    tenant_id: String,
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database for a tenant under the configured data dir.
    pub fn open_tenant(tenant_id: &str) -> Result<Self, DatabaseError> {
        let path = config::tenant_db_path(tenant_id);
        Self::open(tenant_id, &path)
    }

    /// Open (or create) a tenant database at an explicit path.
    pub fn open(tenant_id: &str, path: &Path) -> Result<Self, DatabaseError> {
        let conn = open_database(path)?;
        tracing::info!(tenant_id, path = %path.display(), "Tenant store opened");
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store (for testing).
    pub fn in_memory(tenant_id: &str) -> Result<Self, DatabaseError> {
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            path: None,
            conn: Mutex::new(open_memory_database()?),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure against the tenant connection.
    pub fn with_conn<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let guard = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&guard)
    }

    /// Run a closure inside a transaction. Commits on `Ok`, rolls back on `Err`.
    pub fn with_tx<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let mut guard = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        let tx = guard.transaction().map_err(DatabaseError::from)?;
        let out = f(&tx)?;
        tx.commit().map_err(DatabaseError::from)?;
        Ok(out)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("tenant_id", &self.tenant_id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
