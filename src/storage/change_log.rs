//! Append-only change log
//!
//! One entry per successful mutation, in commit order. Entries are never
//! mutated or compacted. Sequence numbers start at 1 and increase by one.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::document::{Document, DocumentPath};

/// Kind of mutation recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Create => write!(f, "CREATE"),
            ChangeKind::Update => write!(f, "UPDATE"),
            ChangeKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Immutable record of one mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    pub sequence: u64,
    pub kind: ChangeKind,
    pub tenant_id: String,
    pub path: DocumentPath,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    /// Version after the mutation; for deletes, the tombstone version
    pub version: u64,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A committed document change, handed to derived-state maintainers.
///
/// `before` is `None` for creates, `after` is `None` for deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub tenant_id: String,
    pub path: DocumentPath,
    pub before: Option<Document>,
    pub after: Option<Document>,
}

impl DocumentChange {
    pub fn collection(&self) -> &str {
        self.path.collection()
    }
}

/// Receiver of committed changes.
///
/// The engine calls `apply_change` synchronously, in commit order, before
/// the mutating call returns.
pub trait ChangeSink: Send + Sync {
    fn apply_change(&self, change: &DocumentChange);
}

/// Metadata attached to an entry at append time
#[derive(Debug, Clone, Default)]
pub(crate) struct EntryMeta {
    pub actor: String,
    pub idempotency_key: Option<String>,
    pub transaction_id: Option<String>,
}

/// The log itself
#[derive(Debug, Default)]
pub struct ChangeLog {
    entries: Vec<ChangeLogEntry>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry for `change`, returning its sequence number.
    pub(crate) fn append(
        &mut self,
        change: &DocumentChange,
        meta: EntryMeta,
        timestamp: DateTime<Utc>,
    ) -> u64 {
        let sequence = self.entries.len() as u64 + 1;
        let version = match (&change.after, &change.before) {
            (Some(after), _) => after.version,
            (None, Some(before)) => before.version + 1,
            (None, None) => 0,
        };

        self.entries.push(ChangeLogEntry {
            sequence,
            kind: change.kind,
            tenant_id: change.tenant_id.clone(),
            path: change.path.clone(),
            before: change.before.as_ref().map(|d| d.data.clone()),
            after: change.after.as_ref().map(|d| d.data.clone()),
            version,
            actor: meta.actor,
            idempotency_key: meta.idempotency_key,
            transaction_id: meta.transaction_id,
            timestamp,
        });
        sequence
    }

    /// Entries strictly newer than `since`, optionally for one tenant.
    pub fn since(&self, since: DateTime<Utc>, tenant: Option<&str>) -> Vec<ChangeLogEntry> {
        // Timestamps are non-decreasing, so binary search for the start.
        let start = self.entries.partition_point(|e| e.timestamp <= since);
        self.entries[start..]
            .iter()
            .filter(|e| tenant.map_or(true, |t| e.tenant_id == t))
            .cloned()
            .collect()
    }

    /// Entries with a sequence number greater than `sequence`.
    pub fn after(&self, sequence: u64) -> Vec<ChangeLogEntry> {
        let start = (sequence as usize).min(self.entries.len());
        self.entries[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_sequence(&self) -> u64 {
        self.entries.len() as u64
    }
}
