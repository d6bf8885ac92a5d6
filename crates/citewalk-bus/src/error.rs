//! Event bus error types.

use citewalk_core::db::DatabaseError;

/// Errors surfaced by the event bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Topic already exists: {0}")]
    TopicAlreadyExists(String),

    #[error("Invalid topic name: {0:?}")]
    InvalidTopic(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Event bus is shut down")]
    Closed,
}
