//! Document storage subsystem
//!
//! The storage engine holds the canonical state of every document, keyed by
//! tenant and path. Writes are guarded by optimistic version checks, made
//! retry-safe by idempotency keys, and recorded in an append-only change log.
//!
//! # Design Principles
//!
//! - Versions start at 1 and increase by exactly 1 per successful update
//! - A failed write changes nothing
//! - Tenants never observe each other's documents
//! - Every committed change reaches the change log and the change sink in
//!   commit order

mod change_log;
mod document;
mod engine;
mod errors;
mod idempotency;
mod transaction;

pub use change_log::{ChangeKind, ChangeLog, ChangeLogEntry, ChangeSink, DocumentChange};
pub use document::{lookup_dotted, merge_shallow, Document, DocumentPath};
pub use engine::{DeleteOptions, DocumentView, StorageEngine, UpdateOptions, WriteOptions};
pub use errors::{StorageError, StorageResult};
pub use transaction::{CommitReceipt, OpResult, ReadVersion, TransactionContext, TxOperation};
