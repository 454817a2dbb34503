//! Crate-level errors
//!
//! Wraps each subsystem's error and adds the failures that only exist at the
//! request boundary.

use thiserror::Error;

use crate::index::IndexError;
use crate::rules::{AccessKind, RulesError};
use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Rules(#[from] RulesError),

    /// The rules denied the request
    #[error("{operation} on {path} denied: {reason}")]
    AccessDenied {
        operation: AccessKind,
        path: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Get error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::Storage(e) => e.code(),
            Self::Index(e) => e.code(),
            Self::Rules(e) => e.code(),
            Self::AccessDenied { .. } => "ACCESS_DENIED",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Storage(StorageError::NotFound { .. }) => 404,
            Self::Storage(e) if e.is_conflict() => 409,
            Self::Storage(e) if e.is_client_error() => 400,
            Self::Index(IndexError::IndexNotFound(_)) => 404,
            Self::Index(IndexError::IndexExists(_)) => 409,
            Self::Index(e) if e.is_client_error() => 400,
            Self::AccessDenied { .. } => 403,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_pass_through() {
        let err: Error = StorageError::TransactionTooLarge { limit: 500 }.into();
        assert_eq!(err.code(), "TRANSACTION_TOO_LARGE");
        assert_eq!(err.status_code(), 400);

        let err = Error::AccessDenied {
            operation: AccessKind::Get,
            path: "orders/o1".into(),
            reason: "no rule matches this path".into(),
        };
        assert_eq!(err.code(), "ACCESS_DENIED");
        assert_eq!(err.status_code(), 403);
        assert_eq!(err.to_string(), "get on orders/o1 denied: no rule matches this path");
    }

    #[test]
    fn test_conflicts_map_to_409() {
        let err: Error = StorageError::VersionConflict {
            path: "orders/o1".into(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert_eq!(err.status_code(), 409);
    }
}
