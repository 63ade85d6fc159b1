//! session layer error types

use thiserror::Error;

use crate::session::record::{EntityId, Version};

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised by a session provider.
#[derive(Debug, Error)]
pub enum SessionError {
    /// the record does not exist in the store
    #[error("record not found: {0}")]
    NotFound(EntityId),

    /// write was based on a version that is no longer current
    #[error("stale version for {id}: written from version {expected}, store has {found}")]
    StaleVersion {
        id: EntityId,
        expected: Version,
        found: Version,
    },

    /// the session already reached commit or rollback
    #[error("session {0} is closed")]
    Closed(u64),

    /// malformed record data
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// the backend refused the operation
    #[error("backend failure: {0}")]
    Backend(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SessionError {
    /// Check whether this is a lost-update detection.
    pub fn is_stale(&self) -> bool {
        matches!(self, SessionError::StaleVersion { .. })
    }
}
