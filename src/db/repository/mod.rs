//! Repository layer: entity-scoped database operations.
//!
//! Ids are stored as TEXT, timestamps as RFC 3339 text via rusqlite's chrono
//! support, list-valued columns as JSON.

mod alert;
mod device;
mod measurement;
mod prescription;
mod program;
mod rule;
mod session;

use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::DatabaseError;

pub use alert::*;
pub use device::*;
pub use measurement::*;
pub use prescription::*;
pub use program::*;
pub use rule::*;
pub use session::*;

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

pub(crate) fn parse_opt_uuid(s: Option<String>) -> Result<Option<Uuid>, DatabaseError> {
    s.as_deref().map(parse_uuid).transpose()
}

pub(crate) fn parse_json<T: DeserializeOwned>(s: &str) -> Result<T, DatabaseError> {
    Ok(serde_json::from_str(s)?)
}

pub(crate) fn parse_opt_json<T: DeserializeOwned>(
    s: Option<String>,
) -> Result<Option<T>, DatabaseError> {
    s.as_deref().map(parse_json).transpose()
}

#[cfg(test)]
pub(crate) use session::tests::make_session as session_fixture;
