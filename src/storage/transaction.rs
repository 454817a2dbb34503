//! Optimistic transactions
//!
//! A transaction buffers writes and remembers the version of every document
//! it read. Nothing is locked between begin and commit; at commit the engine
//! re-validates the read set and every buffered precondition, and only then
//! replays the writes. A failed commit leaves no partial state.
//!
//! Rules:
//! - A read of an absent document records version 0, so a concurrent create
//!   is a conflict.
//! - The first read of a path wins; re-reading does not refresh the version.
//! - Blind writes (writes without a read) only conflict through their own
//!   preconditions (`if_version`, create-on-occupied, update-on-absent).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::document::{Document, DocumentPath};
use super::errors::{StorageError, StorageResult};

/// One buffered write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TxOperation {
    Create {
        path: DocumentPath,
        data: Value,
    },
    Update {
        path: DocumentPath,
        data: Value,
        #[serde(default)]
        if_version: Option<u64>,
        #[serde(default)]
        merge: bool,
    },
    Delete {
        path: DocumentPath,
        #[serde(default)]
        if_version: Option<u64>,
    },
}

impl TxOperation {
    pub fn create(path: &str, data: Value) -> StorageResult<Self> {
        Ok(Self::Create {
            path: DocumentPath::parse(path)?,
            data,
        })
    }

    pub fn update(path: &str, data: Value, if_version: Option<u64>) -> StorageResult<Self> {
        Ok(Self::Update {
            path: DocumentPath::parse(path)?,
            data,
            if_version,
            merge: false,
        })
    }

    pub fn merge(path: &str, data: Value, if_version: Option<u64>) -> StorageResult<Self> {
        Ok(Self::Update {
            path: DocumentPath::parse(path)?,
            data,
            if_version,
            merge: true,
        })
    }

    pub fn delete(path: &str, if_version: Option<u64>) -> StorageResult<Self> {
        Ok(Self::Delete {
            path: DocumentPath::parse(path)?,
            if_version,
        })
    }

    pub fn path(&self) -> &DocumentPath {
        match self {
            Self::Create { path, .. } | Self::Update { path, .. } | Self::Delete { path, .. } => {
                path
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

/// A version the caller observed outside the transaction, 0 for absent.
///
/// Lets a client that read through plain `get` calls hand its read set to
/// the commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadVersion {
    pub path: DocumentPath,
    #[serde(default)]
    pub version: u64,
}

impl ReadVersion {
    pub fn new(path: &str, version: u64) -> StorageResult<Self> {
        Ok(Self {
            path: DocumentPath::parse(path)?,
            version,
        })
    }

    pub fn absent(path: &str) -> StorageResult<Self> {
        Self::new(path, 0)
    }
}

/// Result of one replayed operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OpResult {
    Written { document: Document },
    Deleted { existed: bool },
}

/// Outcome of a successful commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub transaction_id: String,
    pub results: Vec<OpResult>,
}

/// State for one commit attempt.
///
/// Scoped to a single tenant and discarded after commit or abort.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    id: String,
    tenant: String,
    operations: Vec<TxOperation>,
    read_versions: HashMap<DocumentPath, u64>,
    started_at: DateTime<Utc>,
    max_operations: usize,
}

impl TransactionContext {
    pub(crate) fn new(tenant: &str, max_operations: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant: tenant.to_string(),
            operations: Vec::new(),
            read_versions: HashMap::new(),
            started_at: Utc::now(),
            max_operations,
        }
    }

    /// Reuse a caller-chosen id so a retried commit replays the first one.
    pub(crate) fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Queue a write. Fails once the buffer is full.
    pub fn add(&mut self, op: TxOperation) -> StorageResult<()> {
        if self.operations.len() >= self.max_operations {
            return Err(StorageError::TransactionTooLarge {
                limit: self.max_operations,
            });
        }
        self.operations.push(op);
        Ok(())
    }

    /// Remember the version observed for `path` (0 = absent).
    pub(crate) fn record_read(&mut self, path: DocumentPath, version: u64) {
        self.read_versions.entry(path).or_insert(version);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn operations(&self) -> &[TxOperation] {
        &self.operations
    }

    pub fn read_versions(&self) -> &HashMap<DocumentPath, u64> {
        &self.read_versions
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Idempotency key derived for the operation at `index`.
    pub fn derived_key(&self, index: usize) -> String {
        format!("{}#{}", self.id, index)
    }
}
