//! Storage error types
//!
//! Every variant is surfaced synchronously to the caller and never retried
//! inside the engine. Retry policy belongs to the caller.

use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage engine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Read or update of a document that does not exist
    #[error("Document not found: {path} (tenant {tenant})")]
    NotFound { tenant: String, path: String },

    /// Create on an occupied path
    #[error("Document already exists: {path} (tenant {tenant})")]
    AlreadyExists { tenant: String, path: String },

    /// Optimistic-lock mismatch
    #[error("Version conflict on {path}: expected {expected}, found {actual}")]
    VersionConflict {
        path: String,
        expected: u64,
        /// Current version, 0 when the document is absent
        actual: u64,
    },

    /// Too many operations buffered in one transaction
    #[error("Transaction exceeds {limit} operations")]
    TransactionTooLarge { limit: usize },

    /// Malformed document path
    #[error("Invalid document path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// An idempotency key already recorded for a different kind of write
    #[error("Idempotency key '{key}' was already used for a {recorded} operation")]
    IdempotencyKeyReused { key: String, recorded: &'static str },

    /// Operation precondition failed while validating a transaction commit
    #[error("Transaction {transaction_id} aborted at operation {index}: {source}")]
    TransactionAborted {
        transaction_id: String,
        index: usize,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    pub fn not_found(tenant: &str, path: impl Into<String>) -> Self {
        Self::NotFound {
            tenant: tenant.to_string(),
            path: path.into(),
        }
    }

    pub fn already_exists(tenant: &str, path: impl Into<String>) -> Self {
        Self::AlreadyExists {
            tenant: tenant.to_string(),
            path: path.into(),
        }
    }

    pub fn version_conflict(path: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::VersionConflict {
            path: path.into(),
            expected,
            actual,
        }
    }

    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::NotFound { .. } => "NOT_FOUND",
            StorageError::AlreadyExists { .. } => "ALREADY_EXISTS",
            StorageError::VersionConflict { .. } => "VERSION_CONFLICT",
            StorageError::TransactionTooLarge { .. } => "TRANSACTION_TOO_LARGE",
            StorageError::InvalidPath { .. } => "INVALID_PATH",
            StorageError::IdempotencyKeyReused { .. } => "IDEMPOTENCY_KEY_REUSED",
            StorageError::TransactionAborted { source, .. } => source.code(),
        }
    }

    /// Whether this is an optimistic-concurrency failure the caller should
    /// answer with re-read-and-retry.
    pub fn is_conflict(&self) -> bool {
        match self {
            StorageError::VersionConflict { .. } => true,
            StorageError::TransactionAborted { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// All storage errors are caused by the request, not the engine.
    pub fn is_client_error(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(StorageError::not_found("t", "a/b").code(), "NOT_FOUND");
        assert_eq!(StorageError::already_exists("t", "a/b").code(), "ALREADY_EXISTS");
        assert_eq!(
            StorageError::version_conflict("a/b", 1, 2).code(),
            "VERSION_CONFLICT"
        );
        assert_eq!(
            StorageError::TransactionTooLarge { limit: 500 }.code(),
            "TRANSACTION_TOO_LARGE"
        );
    }

    #[test]
    fn test_aborted_transaction_reports_cause() {
        let err = StorageError::TransactionAborted {
            transaction_id: "tx1".into(),
            index: 3,
            source: Box::new(StorageError::version_conflict("a/b", 1, 2)),
        };
        assert_eq!(err.code(), "VERSION_CONFLICT");
        assert!(err.is_conflict());
        assert!(err.to_string().contains("operation 3"));
    }

    #[test]
    fn test_display_names_path() {
        let err = StorageError::version_conflict("tenants/T1/orders/O1", 3, 4);
        let display = err.to_string();
        assert!(display.contains("tenants/T1/orders/O1"));
        assert!(display.contains("expected 3"));
    }
}
