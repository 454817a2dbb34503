//! Storage engine
//!
//! Sole owner of document state, versions, the change log and the
//! idempotency table.
//!
//! # Concurrency
//!
//! Each call takes the state lock for the duration of its own
//! check-and-apply and releases it before returning. No lock is ever held
//! between a caller's read and its later write: a read-modify-write cycle is
//! guarded only by `if_version`, so of two writers holding the same version
//! exactly one succeeds and the other gets `VersionConflict`.
//!
//! # Derived state
//!
//! Every committed change is appended to the change log and handed to the
//! configured [`ChangeSink`] while the state lock is still held, so sinks see
//! changes in commit order and a read issued after a write returns observes
//! the sink's updated state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::CacheStats;
use crate::config::StorageConfig;
use crate::observability::Event;

use super::change_log::{ChangeKind, ChangeLog, ChangeLogEntry, ChangeSink, DocumentChange, EntryMeta};
use super::document::{merge_shallow, Document, DocumentPath};
use super::errors::{StorageError, StorageResult};
use super::idempotency::{expect_created, expect_deleted, expect_updated, key_reused, IdempotencyTable, Recorded};
use super::transaction::{CommitReceipt, OpResult, TransactionContext, TxOperation};

/// Options for `create`
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub idempotency_key: Option<String>,
}

impl WriteOptions {
    pub fn idempotent(key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
        }
    }
}

/// Options for `update`
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub if_version: Option<u64>,
    pub idempotency_key: Option<String>,
    /// Shallow-merge into the existing payload instead of replacing it
    pub merge: bool,
}

impl UpdateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn if_version(mut self, version: u64) -> Self {
        self.if_version = Some(version);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn merge(mut self) -> Self {
        self.merge = true;
        self
    }
}

/// Options for `delete`
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub if_version: Option<u64>,
    pub idempotency_key: Option<String>,
}

impl DeleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn if_version(mut self, version: u64) -> Self {
        self.if_version = Some(version);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

type DocKey = (String, DocumentPath);

fn doc_key(tenant: &str, path: &DocumentPath) -> DocKey {
    (tenant.to_string(), path.clone())
}

/// Hands out strictly increasing microsecond timestamps.
#[derive(Debug, Default)]
struct MonotonicClock {
    last: Option<DateTime<Utc>>,
}

impl MonotonicClock {
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let next = match self.last {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last = Some(next);
        next
    }
}

struct StoreState {
    documents: BTreeMap<DocKey, Document>,
    log: ChangeLog,
    idempotency: IdempotencyTable,
    clock: MonotonicClock,
}

impl StoreState {
    fn version_of(&self, tenant: &str, path: &DocumentPath) -> Option<u64> {
        self.documents
            .get(&doc_key(tenant, path))
            .map(|doc| doc.version)
    }

    fn apply_create(
        &mut self,
        tenant: &str,
        path: DocumentPath,
        data: Value,
        now: DateTime<Utc>,
    ) -> StorageResult<(Document, DocumentChange)> {
        let key = doc_key(tenant, &path);
        if self.documents.contains_key(&key) {
            return Err(StorageError::already_exists(tenant, path.as_str()));
        }

        let doc = Document::new(path.clone(), data, tenant, now);
        self.documents.insert(key, doc.clone());
        let change = DocumentChange {
            kind: ChangeKind::Create,
            tenant_id: tenant.to_string(),
            path,
            before: None,
            after: Some(doc.clone()),
        };
        Ok((doc, change))
    }

    fn apply_update(
        &mut self,
        tenant: &str,
        path: DocumentPath,
        data: Value,
        if_version: Option<u64>,
        merge: bool,
        now: DateTime<Utc>,
    ) -> StorageResult<(Document, DocumentChange)> {
        let Some(current) = self.documents.get_mut(&doc_key(tenant, &path)) else {
            return Err(StorageError::not_found(tenant, path.as_str()));
        };

        if let Some(expected) = if_version {
            if expected != current.version {
                return Err(StorageError::version_conflict(
                    path.as_str(),
                    expected,
                    current.version,
                ));
            }
        }

        let before = current.clone();
        current.data = if merge {
            merge_shallow(&current.data, data)
        } else {
            data
        };
        current.version += 1;
        current.updated_at = now;

        let doc = current.clone();
        let change = DocumentChange {
            kind: ChangeKind::Update,
            tenant_id: tenant.to_string(),
            path,
            before: Some(before),
            after: Some(doc.clone()),
        };
        Ok((doc, change))
    }

    /// `Ok(None)` when the document was already absent.
    fn apply_delete(
        &mut self,
        tenant: &str,
        path: DocumentPath,
        if_version: Option<u64>,
    ) -> StorageResult<Option<DocumentChange>> {
        let key = doc_key(tenant, &path);
        let Some(current) = self.documents.get(&key) else {
            return Ok(None);
        };

        if let Some(expected) = if_version {
            if expected != current.version {
                return Err(StorageError::version_conflict(
                    path.as_str(),
                    expected,
                    current.version,
                ));
            }
        }

        let before = self.documents.remove(&key);
        Ok(Some(DocumentChange {
            kind: ChangeKind::Delete,
            tenant_id: tenant.to_string(),
            path,
            before,
            after: None,
        }))
    }
}

/// Borrowed read access to documents, see [`StorageEngine::read_view`].
pub struct DocumentView<'a> {
    documents: &'a BTreeMap<DocKey, Document>,
}

impl<'a> DocumentView<'a> {
    pub fn get(&self, tenant: &str, path: &DocumentPath) -> Option<&'a Document> {
        self.documents.get(&doc_key(tenant, path))
    }
}

/// The storage engine.
///
/// Construct it once, optionally wired to a [`ChangeSink`], and share it
/// behind an `Arc`. Independent engines never share state.
pub struct StorageEngine {
    config: StorageConfig,
    state: RwLock<StoreState>,
    sink: Option<Arc<dyn ChangeSink>>,
}

impl StorageEngine {
    /// An engine with no change sink.
    pub fn new(config: StorageConfig) -> Self {
        Self::build(config, None)
    }

    /// An engine that reports every committed change to `sink`.
    pub fn with_sink(config: StorageConfig, sink: Arc<dyn ChangeSink>) -> Self {
        Self::build(config, Some(sink))
    }

    fn build(config: StorageConfig, sink: Option<Arc<dyn ChangeSink>>) -> Self {
        let idempotency =
            IdempotencyTable::new(config.idempotency_capacity, config.idempotency_ttl());
        Self {
            config,
            state: RwLock::new(StoreState {
                documents: BTreeMap::new(),
                log: ChangeLog::new(),
                idempotency,
                clock: MonotonicClock::default(),
            }),
            sink,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read a document. Absent documents are `NotFound`.
    pub fn get(&self, path: &str, tenant: &str) -> StorageResult<Document> {
        let path = DocumentPath::parse(path)?;
        self.find(&path, tenant)
            .ok_or_else(|| StorageError::not_found(tenant, path.as_str()))
    }

    /// Read a document if present.
    pub fn find(&self, path: &DocumentPath, tenant: &str) -> Option<Document> {
        self.state
            .read()
            .documents
            .get(&doc_key(tenant, path))
            .cloned()
    }

    /// Unindexed scan of one collection, for administrative tooling.
    ///
    /// Without a tenant the scan covers every tenant.
    pub fn scan_collection(&self, collection: &str, tenant: Option<&str>) -> Vec<Document> {
        let state = self.state.read();
        state
            .documents
            .values()
            .filter(|doc| doc.collection == collection)
            .filter(|doc| tenant.map_or(true, |t| doc.tenant_id == t))
            .cloned()
            .collect()
    }

    /// Run `f` over every document of `collection` (all tenants) while
    /// holding the state lock, so no write can interleave.
    pub fn with_collection<R>(&self, collection: &str, f: impl FnOnce(&[&Document]) -> R) -> R {
        let state = self.state.read();
        let docs: Vec<&Document> = state
            .documents
            .values()
            .filter(|doc| doc.collection == collection)
            .collect();
        f(&docs)
    }

    /// Run `f` against a consistent view of every document.
    ///
    /// The state lock is held for the duration of `f`, so `f` must not call
    /// back into the engine.
    pub fn read_view<R>(&self, f: impl FnOnce(DocumentView<'_>) -> R) -> R {
        let state = self.state.read();
        f(DocumentView {
            documents: &state.documents,
        })
    }

    /// Change-log entries newer than `since`.
    pub fn changes_since(&self, since: DateTime<Utc>, tenant: Option<&str>) -> Vec<ChangeLogEntry> {
        self.state.read().log.since(since, tenant)
    }

    /// Change-log entries after a sequence number.
    pub fn changes_after(&self, sequence: u64) -> Vec<ChangeLogEntry> {
        self.state.read().log.after(sequence)
    }

    pub fn last_sequence(&self) -> u64 {
        self.state.read().log.last_sequence()
    }

    pub fn document_count(&self) -> usize {
        self.state.read().documents.len()
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Create a document at version 1.
    pub fn create(
        &self,
        path: &str,
        data: Value,
        tenant: &str,
        actor: &str,
        options: WriteOptions,
    ) -> StorageResult<Document> {
        let path = DocumentPath::parse(path)?;
        let mut state = self.state.write();

        if let Some(key) = options.idempotency_key.as_deref() {
            if let Some(recorded) = state.idempotency.lookup(tenant, key) {
                log_replay(tenant, &path, key);
                return expect_created(key, recorded);
            }
        }

        let now = state.clock.tick();
        let (doc, change) = state.apply_create(tenant, path, data, now)?;
        self.publish(&mut state, &change, actor, options.idempotency_key.clone(), None, now);

        if let Some(key) = options.idempotency_key.as_deref() {
            state
                .idempotency
                .record(tenant, key, Recorded::Created(doc.clone()));
        }

        debug!(
            event = Event::DocumentCreated.as_str(),
            tenant,
            path = doc.path.as_str(),
            actor,
            "document created"
        );
        Ok(doc)
    }

    /// Replace (or with `merge`, shallow-merge) a document's payload.
    pub fn update(
        &self,
        path: &str,
        data: Value,
        tenant: &str,
        actor: &str,
        options: UpdateOptions,
    ) -> StorageResult<Document> {
        let path = DocumentPath::parse(path)?;
        let mut state = self.state.write();

        if let Some(key) = options.idempotency_key.as_deref() {
            if let Some(recorded) = state.idempotency.lookup(tenant, key) {
                log_replay(tenant, &path, key);
                return expect_updated(key, recorded);
            }
        }

        let now = state.clock.tick();
        let (doc, change) = match state.apply_update(
            tenant,
            path.clone(),
            data,
            options.if_version,
            options.merge,
            now,
        ) {
            Ok(written) => written,
            Err(err) => {
                log_failure(tenant, &path, &err);
                return Err(err);
            }
        };
        self.publish(&mut state, &change, actor, options.idempotency_key.clone(), None, now);

        if let Some(key) = options.idempotency_key.as_deref() {
            state
                .idempotency
                .record(tenant, key, Recorded::Updated(doc.clone()));
        }

        debug!(
            event = Event::DocumentUpdated.as_str(),
            tenant,
            path = doc.path.as_str(),
            version = doc.version,
            actor,
            "document updated"
        );
        Ok(doc)
    }

    /// Delete a document. Deleting an absent document succeeds.
    ///
    /// Returns whether a document was removed by this call.
    pub fn delete(
        &self,
        path: &str,
        tenant: &str,
        actor: &str,
        options: DeleteOptions,
    ) -> StorageResult<bool> {
        let path = DocumentPath::parse(path)?;
        let mut state = self.state.write();

        if let Some(key) = options.idempotency_key.as_deref() {
            if let Some(recorded) = state.idempotency.lookup(tenant, key) {
                log_replay(tenant, &path, key);
                return expect_deleted(key, recorded);
            }
        }

        let change = match state.apply_delete(tenant, path.clone(), options.if_version) {
            Ok(change) => change,
            Err(err) => {
                log_failure(tenant, &path, &err);
                return Err(err);
            }
        };

        let existed = change.is_some();
        match change {
            Some(change) => {
                let now = state.clock.tick();
                self.publish(&mut state, &change, actor, options.idempotency_key.clone(), None, now);
                debug!(
                    event = Event::DocumentDeleted.as_str(),
                    tenant,
                    path = path.as_str(),
                    actor,
                    "document deleted"
                );
            }
            None => {
                debug!(
                    event = Event::DeleteAbsent.as_str(),
                    tenant,
                    path = path.as_str(),
                    "delete of absent document"
                );
            }
        }

        if let Some(key) = options.idempotency_key.as_deref() {
            state
                .idempotency
                .record(tenant, key, Recorded::Deleted { existed });
        }
        Ok(existed)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Start a transaction for `tenant`.
    pub fn begin_transaction(&self, tenant: &str) -> TransactionContext {
        TransactionContext::new(tenant, self.config.max_transaction_ops)
    }

    /// Start a transaction under a known id, e.g. when a client retries a
    /// commit whose outcome it never saw.
    pub fn begin_transaction_with_id(&self, tenant: &str, id: &str) -> TransactionContext {
        TransactionContext::new(tenant, self.config.max_transaction_ops).with_id(id)
    }

    /// Queue a write on a transaction.
    pub fn add_to_transaction(
        &self,
        tx: &mut TransactionContext,
        op: TxOperation,
    ) -> StorageResult<()> {
        tx.add(op)
    }

    /// Read through a transaction, recording the observed version.
    pub fn transaction_read(
        &self,
        tx: &mut TransactionContext,
        path: &str,
    ) -> StorageResult<Option<Document>> {
        let path = DocumentPath::parse(path)?;
        let doc = self.find(&path, tx.tenant());
        tx.record_read(path, doc.as_ref().map_or(0, |d| d.version));
        Ok(doc)
    }

    /// Commit a transaction.
    ///
    /// Order of work, all under one state lock:
    /// 1. A commit already applied under this transaction id returns its
    ///    original receipt.
    /// 2. Every recorded read version is re-validated.
    /// 3. Every buffered operation's precondition is checked against the
    ///    state the earlier operations would produce.
    /// 4. Only then are the operations applied, in order, each tagged with a
    ///    derived idempotency key.
    pub fn commit_transaction(
        &self,
        tx: &TransactionContext,
        actor: &str,
    ) -> StorageResult<CommitReceipt> {
        let tenant = tx.tenant();
        let mut state = self.state.write();

        if let Some(recorded) = state.idempotency.lookup(tenant, tx.id()) {
            debug!(
                event = Event::IdempotentReplay.as_str(),
                tenant,
                transaction = tx.id(),
                "transaction commit replayed"
            );
            return match recorded {
                Recorded::Committed(receipt) => Ok(receipt),
                other => Err(key_reused(tx.id(), &other)),
            };
        }

        // Operations already applied under their derived keys.
        let mut replayed: Vec<Option<OpResult>> = Vec::with_capacity(tx.len());
        for index in 0..tx.len() {
            let prior = match state.idempotency.lookup(tenant, &tx.derived_key(index)) {
                Some(Recorded::Op(result)) => Some(result),
                Some(other) => return Err(key_reused(&tx.derived_key(index), &other)),
                None => None,
            };
            replayed.push(prior);
        }
        let fully_replayed = !tx.is_empty() && replayed.iter().all(Option::is_some);

        if !fully_replayed {
            if let Err(err) = validate_read_set(&state, tx) {
                warn!(
                    event = Event::TransactionAborted.as_str(),
                    tenant,
                    transaction = tx.id(),
                    error = %err,
                    "transaction read set is stale"
                );
                return Err(err);
            }
            if let Err(err) = validate_operations(&state, tx, &replayed) {
                warn!(
                    event = Event::TransactionAborted.as_str(),
                    tenant,
                    transaction = tx.id(),
                    error = %err,
                    "transaction precondition failed"
                );
                return Err(err);
            }
        }

        let mut results = Vec::with_capacity(tx.len());
        for (index, op) in tx.operations().iter().enumerate() {
            if let Some(prior) = replayed[index].take() {
                results.push(prior);
                continue;
            }

            let key = tx.derived_key(index);
            let now = state.clock.tick();
            let change = match op.clone() {
                TxOperation::Create { path, data } => {
                    Some(state.apply_create(tenant, path, data, now)?.1)
                }
                TxOperation::Update {
                    path,
                    data,
                    if_version,
                    merge,
                } => Some(state.apply_update(tenant, path, data, if_version, merge, now)?.1),
                TxOperation::Delete { path, if_version } => {
                    state.apply_delete(tenant, path, if_version)?
                }
            };

            let result = match &change {
                Some(change) => {
                    self.publish(
                        &mut state,
                        change,
                        actor,
                        Some(key.clone()),
                        Some(tx.id().to_string()),
                        now,
                    );
                    match &change.after {
                        Some(doc) => OpResult::Written {
                            document: doc.clone(),
                        },
                        None => OpResult::Deleted { existed: true },
                    }
                }
                None => OpResult::Deleted { existed: false },
            };

            state
                .idempotency
                .record(tenant, &key, Recorded::Op(result.clone()));
            results.push(result);
        }

        let receipt = CommitReceipt {
            transaction_id: tx.id().to_string(),
            results,
        };
        state
            .idempotency
            .record(tenant, tx.id(), Recorded::Committed(receipt.clone()));

        debug!(
            event = Event::TransactionCommitted.as_str(),
            tenant,
            transaction = tx.id(),
            operations = tx.len(),
            actor,
            "transaction committed"
        );
        Ok(receipt)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drop expired idempotency entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.state.write().idempotency.sweep(Instant::now())
    }

    pub fn idempotency_stats(&self) -> CacheStats {
        self.state.read().idempotency.stats()
    }

    pub fn idempotency_len(&self) -> usize {
        self.state.read().idempotency.len()
    }

    /// Append to the log and notify the sink. Caller holds the write lock.
    fn publish(
        &self,
        state: &mut StoreState,
        change: &DocumentChange,
        actor: &str,
        idempotency_key: Option<String>,
        transaction_id: Option<String>,
        now: DateTime<Utc>,
    ) {
        state.log.append(
            change,
            EntryMeta {
                actor: actor.to_string(),
                idempotency_key,
                transaction_id,
            },
            now,
        );
        if let Some(sink) = &self.sink {
            sink.apply_change(change);
        }
    }
}

/// Every version read by the transaction must still be current.
fn validate_read_set(state: &StoreState, tx: &TransactionContext) -> StorageResult<()> {
    for (path, read_version) in tx.read_versions() {
        let current = state.version_of(tx.tenant(), path).unwrap_or(0);
        if current != *read_version {
            return Err(StorageError::version_conflict(
                path.as_str(),
                *read_version,
                current,
            ));
        }
    }
    Ok(())
}

/// Check every operation's precondition against the state the preceding
/// operations would leave behind.
fn validate_operations(
    state: &StoreState,
    tx: &TransactionContext,
    replayed: &[Option<OpResult>],
) -> StorageResult<()> {
    let mut overlay: HashMap<&DocumentPath, Option<u64>> = HashMap::new();
    let tenant = tx.tenant();

    for (index, op) in tx.operations().iter().enumerate() {
        if replayed[index].is_some() {
            continue;
        }
        let path = op.path();
        let current = match overlay.get(path) {
            Some(version) => *version,
            None => state.version_of(tenant, path),
        };

        let next = match (op, current) {
            (TxOperation::Create { .. }, Some(_)) => {
                Err(StorageError::already_exists(tenant, path.as_str()))
            }
            (TxOperation::Create { .. }, None) => Ok(Some(1)),
            (TxOperation::Update { .. }, None) => {
                Err(StorageError::not_found(tenant, path.as_str()))
            }
            (TxOperation::Update { if_version, .. }, Some(version)) => match if_version {
                Some(expected) if *expected != version => Err(StorageError::version_conflict(
                    path.as_str(),
                    *expected,
                    version,
                )),
                _ => Ok(Some(version + 1)),
            },
            (TxOperation::Delete { if_version, .. }, Some(version)) => match if_version {
                Some(expected) if *expected != version => Err(StorageError::version_conflict(
                    path.as_str(),
                    *expected,
                    version,
                )),
                _ => Ok(None),
            },
            (TxOperation::Delete { .. }, None) => Ok(None),
        };

        match next {
            Ok(version) => {
                overlay.insert(path, version);
            }
            Err(source) => {
                return Err(StorageError::TransactionAborted {
                    transaction_id: tx.id().to_string(),
                    index,
                    source: Box::new(source),
                });
            }
        }
    }
    Ok(())
}

fn log_replay(tenant: &str, path: &DocumentPath, key: &str) {
    debug!(
        event = Event::IdempotentReplay.as_str(),
        tenant,
        path = path.as_str(),
        idempotency_key = key,
        "idempotent replay"
    );
}

fn log_failure(tenant: &str, path: &DocumentPath, err: &StorageError) {
    if err.is_conflict() {
        warn!(
            event = Event::VersionConflict.as_str(),
            tenant,
            path = path.as_str(),
            error = %err,
            "write rejected"
        );
    }
}
