//! Error types for the tracker and its persistence collaborators.

use thiserror::Error;
use uuid::Uuid;

use crate::model::RunStatus;

/// Failures reported by a [`RunStore`](crate::store::RunStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record {location}: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("{0}")]
    Other(String),
}

/// Errors surfaced by [`IngestRunTracker`](crate::tracker::IngestRunTracker).
#[derive(Debug, Error)]
pub enum IngestRunError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("ingest run not found: {0}")]
    NotFound(Uuid),

    #[error("invalid transition for ingest run {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("id generator returned an already issued id: {0}")]
    IdCollision(Uuid),
}

impl IngestRunError {
    /// Map to an HTTP status code for API responses.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::InvalidTransition { .. } => 409,
            Self::Persistence(_) | Self::IdCollision(_) => 500,
        }
    }
}
