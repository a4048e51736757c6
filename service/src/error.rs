//! Unified error handling for the sync service.
//!
//! Every failure is classified at the boundary where it happens. Transient
//! network and database faults become `Retryable` and stay inside the
//! component that hit them (workers back off, then report `Degraded`);
//! everything else is returned to the caller as-is.

use thiserror::Error;

/// Application error type.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient network or database fault; retried with backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// A write lost to a newer stored copy; handled locally, never fatal.
    #[error("write superseded by a newer stored copy")]
    Superseded,

    /// The supplied configuration is missing required fields.
    #[error("invalid config, missing fields: {}", missing.join(", "))]
    InvalidConfig { missing: Vec<String> },

    /// A peer the operation required did not answer.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// A live user with this id already exists on the external store.
    #[error("username already taken: {0}")]
    UsernameConflict(String),

    /// The external store could not be consulted; creation refused.
    #[error("username uniqueness could not be verified")]
    UniquenessUnverifiable,

    /// Another mode transition is already in flight.
    #[error("a mode transition is already in progress")]
    TransitionBusy,

    /// Snapshot hash or size mismatch on restore; local store untouched.
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// No backup exists under the given id.
    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error(transparent)]
    Core(#[from] flowsync_core::Error),

    /// Unexpected failure; logged with context, task restarts with backoff.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether a worker should back off and retry rather than surface this.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Retryable(_))
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        let transient = matches!(
            e,
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
        );
        if transient {
            SyncError::Retryable(e.to_string())
        } else {
            SyncError::Internal(e.to_string())
        }
    }
}

impl From<object_store::Error> for SyncError {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => SyncError::BackupNotFound(path),
            other => SyncError::Retryable(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Internal(e.to_string())
    }
}

/// Result type alias for service operations.
pub type Result<T> = std::result::Result<T, SyncError>;
