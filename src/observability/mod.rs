//! Observability for tenantdb
//!
//! Logging goes through `tracing`. Every log line names one [`Event`] in its
//! `event` field so downstream tooling can filter on a stable vocabulary
//! rather than on message text.

use std::fmt;

use tracing_subscriber::EnvFilter;

/// Observable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Storage
    DocumentCreated,
    DocumentUpdated,
    DocumentDeleted,
    DeleteAbsent,
    VersionConflict,
    IdempotentReplay,
    IdempotencyEvicted,
    TransactionCommitted,
    TransactionAborted,

    // Index
    IndexCreated,
    IndexDropped,
    QueryPlanned,
    QueryRejected,

    // Rules
    RulesLoaded,
    AccessAllowed,
    AccessDenied,

    // Maintenance
    CacheSwept,
}

impl Event {
    /// Returns the stable event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::DocumentCreated => "DOCUMENT_CREATED",
            Event::DocumentUpdated => "DOCUMENT_UPDATED",
            Event::DocumentDeleted => "DOCUMENT_DELETED",
            Event::DeleteAbsent => "DELETE_ABSENT",
            Event::VersionConflict => "VERSION_CONFLICT",
            Event::IdempotentReplay => "IDEMPOTENT_REPLAY",
            Event::IdempotencyEvicted => "IDEMPOTENCY_EVICTED",
            Event::TransactionCommitted => "TRANSACTION_COMMITTED",
            Event::TransactionAborted => "TRANSACTION_ABORTED",
            Event::IndexCreated => "INDEX_CREATED",
            Event::IndexDropped => "INDEX_DROPPED",
            Event::QueryPlanned => "QUERY_PLANNED",
            Event::QueryRejected => "QUERY_REJECTED",
            Event::RulesLoaded => "RULES_LOADED",
            Event::AccessAllowed => "ACCESS_ALLOWED",
            Event::AccessDenied => "ACCESS_DENIED",
            Event::CacheSwept => "CACHE_SWEPT",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install a JSON `tracing` subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. Returns false if a global
/// subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
