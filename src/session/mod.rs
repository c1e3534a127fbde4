//! Teleconsult sessions: lifecycle state machine, media providers, live
//! connection-quality sampling and signed prescriptions.

pub mod manager;
pub mod prescriptions;
pub mod provider;
pub mod qos;

pub use manager::{SessionClose, SessionManager, SessionStart};
pub use prescriptions::PrescriptionService;
pub use provider::{LocalRoomProvider, MediaProvider, ProviderError, ProviderRegistry};
pub use qos::{QosBounds, QosSampler, QualityDegraded, QualitySource, SimulatedQualitySource};

use uuid::Uuid;

use crate::db::DatabaseError;
use crate::signing::SigningError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Patient consent is required before the session can start")]
    ConsentRequired,

    #[error("No media provider available")]
    NoProviderAvailable,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {entity} {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl SessionError {
    pub(crate) fn session_not_found(id: &Uuid) -> Self {
        Self::NotFound {
            entity: "session",
            id: *id,
        }
    }
}
