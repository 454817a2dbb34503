//! Idempotency table
//!
//! Remembers the result of every write that carried a caller-supplied key so
//! a retry returns the original result instead of executing again. Keys are
//! scoped per tenant and bounded by TTL and capacity.
//!
//! When the table is full the least recently used key is dropped even if its
//! TTL has not passed; a retry carrying that key executes again. Such
//! evictions are logged as `IDEMPOTENCY_EVICTED`.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::cache::{CacheStats, TtlCache};
use crate::observability::Event;

use super::document::Document;
use super::errors::{StorageError, StorageResult};
use super::transaction::{CommitReceipt, OpResult};

/// A remembered write result
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Recorded {
    Created(Document),
    Updated(Document),
    Deleted { existed: bool },
    Op(OpResult),
    Committed(CommitReceipt),
}

impl Recorded {
    fn kind(&self) -> &'static str {
        match self {
            Recorded::Created(_) => "create",
            Recorded::Updated(_) => "update",
            Recorded::Deleted { .. } => "delete",
            Recorded::Op(_) => "transaction operation",
            Recorded::Committed(_) => "commit",
        }
    }
}

pub(crate) struct IdempotencyTable {
    cache: TtlCache<(String, String), Recorded>,
}

impl IdempotencyTable {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: TtlCache::new(capacity, ttl),
        }
    }

    pub fn lookup(&mut self, tenant: &str, key: &str) -> Option<Recorded> {
        self.cache
            .get(&(tenant.to_string(), key.to_string()), Instant::now())
    }

    pub fn record(&mut self, tenant: &str, key: &str, result: Recorded) {
        let evicted = self
            .cache
            .insert((tenant.to_string(), key.to_string()), result, Instant::now());
        if let Some((tenant, key)) = evicted {
            warn!(
                event = Event::IdempotencyEvicted.as_str(),
                tenant = tenant.as_str(),
                key = key.as_str(),
                ttl_secs = self.cache.ttl().as_secs(),
                "idempotency key evicted before its ttl"
            );
        }
    }

    pub fn sweep(&mut self, now: Instant) -> usize {
        self.cache.sweep(now)
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }
}

/// Error for a key replayed against a different kind of write.
pub(crate) fn key_reused(key: &str, recorded: &Recorded) -> StorageError {
    StorageError::IdempotencyKeyReused {
        key: key.to_string(),
        recorded: recorded.kind(),
    }
}

/// Unwrap a replayed create.
pub(crate) fn expect_created(key: &str, recorded: Recorded) -> StorageResult<Document> {
    match recorded {
        Recorded::Created(doc) => Ok(doc),
        other => Err(key_reused(key, &other)),
    }
}

/// Unwrap a replayed update.
pub(crate) fn expect_updated(key: &str, recorded: Recorded) -> StorageResult<Document> {
    match recorded {
        Recorded::Updated(doc) => Ok(doc),
        other => Err(key_reused(key, &other)),
    }
}

/// Unwrap a replayed delete.
pub(crate) fn expect_deleted(key: &str, recorded: Recorded) -> StorageResult<bool> {
    match recorded {
        Recorded::Deleted { existed } => Ok(existed),
        other => Err(key_reused(key, &other)),
    }
}
