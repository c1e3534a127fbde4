//! Remote monitoring: measurement ingestion, anomaly detection, alert rules,
//! program management and the periodic housekeeping sweep.

pub mod alerts;
pub mod dispatcher;
pub mod housekeeping;
pub mod ingest;
pub mod insights;
pub mod programs;
pub mod rules;
pub mod window;

pub use alerts::AlertReview;
pub use dispatcher::{IngestionDispatcher, IngestionHandle};
pub use housekeeping::{Housekeeper, HousekeepingTask, SweepReport};
pub use ingest::ProgramIngestor;
pub use programs::ProgramService;
pub use rules::RuleEngine;
pub use window::{AnomalyDetector, MeasurementWindow};

use uuid::Uuid;

use crate::db::DatabaseError;

#[derive(Debug, thiserror::Error)]
pub enum MonitoringError {
    #[error("Program not found: {0}")]
    ProgramNotFound(Uuid),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Ingestion pipeline unavailable")]
    Unavailable,
    #[error("Ingestion queue full for program {0}")]
    QueueFull(Uuid),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
