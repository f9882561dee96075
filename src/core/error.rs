//! Error types for sync operations
//!
//! Structured errors with a recoverability policy: transport and patch
//! failures are retryable or absorbed by the handler that hit them, storage
//! failures are fatal to the request that triggered them.

use thiserror::Error;

/// Errors produced by the relay and client cores.
#[derive(Error, Debug)]
pub enum SyncError {
    // ========== Transport ==========
    #[error("Not connected to relay")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Payload exceeds {max} bytes: {actual}")]
    PayloadTooLarge { max: usize, actual: usize },

    // ========== Patches ==========
    #[error("Malformed patch: {0}")]
    MalformedPatch(String),

    #[error("Patch applied partially: {failed} of {total} hunks failed")]
    PartialApply { failed: usize, total: usize },

    // ========== Locks ==========
    #[error("File locked by {holder}: {file}")]
    FileLocked { file: String, holder: String },

    #[error("Lock not held by {holder}: {file}")]
    NotLockHolder { file: String, holder: String },

    // ========== Files ==========
    #[error("Not valid UTF-8 text: {path}")]
    NotText { path: String },

    #[error("Unknown diff id: {0}")]
    UnknownDiff(i64),

    // ========== Storage ==========
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether a retry of the same operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NotConnected
                | SyncError::ConnectionFailed(_)
                | SyncError::HandshakeTimeout
        )
    }
}

impl From<redb::Error> for SyncError {
    fn from(e: redb::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<redb::DatabaseError> for SyncError {
    fn from(e: redb::DatabaseError) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for SyncError {
    fn from(e: redb::TransactionError) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for SyncError {
    fn from(e: redb::TableError) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for SyncError {
    fn from(e: redb::StorageError) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for SyncError {
    fn from(e: redb::CommitError) -> Self {
        SyncError::Storage(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::NotConnected.is_retryable());
        assert!(SyncError::HandshakeTimeout.is_retryable());
        assert!(!SyncError::Storage("boom".into()).is_retryable());
        assert!(!SyncError::MalformedPatch("bad header".into()).is_retryable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = SyncError::FileLocked {
            file: "src/app.ts".into(),
            holder: "alice".into(),
        };
        assert!(err.to_string().contains("alice"));
        assert!(err.to_string().contains("src/app.ts"));
    }
}
