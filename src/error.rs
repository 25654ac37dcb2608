use thiserror::Error;
use uuid::Uuid;

use crate::models::session::{SessionAction, SessionState, StaleTransitionNotice};
use crate::models::sync::EntityKey;

/// Errors surfaced by every engine operation
///
/// Each variant carries enough context (entity, transition, versions) for the
/// caller to decide how to retry.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Not found: {entity}")]
    NotFound { entity: String },

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("Cannot {action} session {session_id} from {from} as {actor}: {reason}")]
    InvalidTransition {
        session_id: Uuid,
        actor: String,
        action: SessionAction,
        from: SessionState,
        reason: String,
    },

    #[error("Backing store unavailable after {attempts} attempt(s): {reason}")]
    StoreUnavailable { attempts: u32, reason: String },

    /// The store answered but the request cannot succeed as is (corrupt
    /// document, rejected query); never retried
    #[error("Backing store failure: {reason}")]
    Storage { reason: String },

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),
}

impl CoreError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: impl ToString) -> Self {
        CoreError::NotFound {
            entity: entity.to_string(),
        }
    }

    /// Whether a re-read and retry can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Conflict(ConflictError::VersionMismatch { .. })
                | CoreError::StoreUnavailable { .. }
        )
    }
}

/// Concurrent-write and duplicate-session conflicts
#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("Version mismatch on {entity}: expected {expected}, observed {observed}")]
    VersionMismatch {
        entity: EntityKey,
        expected: u64,
        observed: u64,
    },

    #[error("Active session {session_id} already exists between {proposer} and {recipient}")]
    ActiveSessionExists {
        proposer: String,
        recipient: String,
        session_id: Uuid,
    },

    #[error("Stale transition: {0}")]
    StaleTransition(StaleTransitionNotice),
}

/// Errors raised by backing-store implementations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Version mismatch on {key}: expected {expected}, actual {actual}")]
    VersionMismatch {
        key: EntityKey,
        expected: u64,
        actual: u64,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt document {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// Failures worth retrying with backoff
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionMismatch { key, expected, actual } => {
                CoreError::Conflict(ConflictError::VersionMismatch {
                    entity: key,
                    expected,
                    observed: actual,
                })
            }
            // Only connectivity failures become the retried `StoreUnavailable`
            other if other.is_unavailable() => CoreError::StoreUnavailable {
                attempts: 1,
                reason: other.to_string(),
            },
            other => CoreError::Storage {
                reason: other.to_string(),
            },
        }
    }
}
