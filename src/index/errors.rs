//! Index error types
//!
//! Error codes:
//! - QUERY_NOT_INDEXED (carries a ready-to-use index definition)
//! - INVALID_QUERY
//! - INVALID_INDEX_DEFINITION
//! - INDEX_EXISTS / INDEX_NOT_FOUND

use thiserror::Error;

use crate::storage::StorageError;

use super::definition::IndexDefinition;

/// Result type for index operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Index system errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// No declared index can serve the query
    #[error("Query on '{collection}' is not indexed: {reason}; suggested index {suggested}")]
    QueryNotIndexed {
        collection: String,
        reason: String,
        suggested: IndexDefinition,
    },

    /// Query is malformed regardless of available indexes
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Index definition rejected at creation
    #[error("Invalid index definition: {0}")]
    InvalidDefinition(String),

    #[error("Index '{0}' already exists")]
    IndexExists(String),

    #[error("Index '{0}' not found")]
    IndexNotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IndexError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            IndexError::QueryNotIndexed { .. } => "QUERY_NOT_INDEXED",
            IndexError::InvalidQuery(_) => "INVALID_QUERY",
            IndexError::InvalidDefinition(_) => "INVALID_INDEX_DEFINITION",
            IndexError::IndexExists(_) => "INDEX_EXISTS",
            IndexError::IndexNotFound(_) => "INDEX_NOT_FOUND",
            IndexError::Storage(err) => err.code(),
        }
    }

    pub fn is_client_error(&self) -> bool {
        match self {
            IndexError::Storage(err) => err.is_client_error(),
            _ => true,
        }
    }

    /// The suggested definition, for `QueryNotIndexed`.
    pub fn suggested_index(&self) -> Option<&IndexDefinition> {
        match self {
            IndexError::QueryNotIndexed { suggested, .. } => Some(suggested),
            _ => None,
        }
    }
}
