//! Error types for the push pipeline.

use citewalk_core::db::DatabaseError;
use citewalk_crypto::CryptoError;

/// Errors from the token store, outbox and worker.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// Caller-supplied input was rejected.
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Event bus error: {0}")]
    Bus(#[from] citewalk_bus::BusError),
}

impl From<PushError> for tonic::Status {
    fn from(e: PushError) -> Self {
        match e {
            PushError::Validation(msg) => Self::invalid_argument(msg),
            other => Self::internal(other.to_string()),
        }
    }
}
