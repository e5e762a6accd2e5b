//! Broker-level error type.

use crate::storage::DatabaseError;
use crate::updates::PayloadError;

/// Errors surfaced by broker components.
///
/// Input validation always runs before the store is touched, so a
/// `Validation` error never leaves a side effect behind.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Tunnel port pool exhausted")]
    AllocationExhausted,

    #[error("Enrollment token expired")]
    TokenExpired,

    #[error("Enrollment token already used")]
    TokenAlreadyUsed,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Update payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Storage error: {0}")]
    Storage(DatabaseError),
}

impl From<DatabaseError> for BrokerError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            DatabaseError::Conflict(what) => Self::Conflict(what),
            other => Self::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
