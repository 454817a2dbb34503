//! Index subsystem
//!
//! Compound indexes are derived, in-memory state maintained from storage
//! change notifications.
//!
//! # Design Principles
//!
//! - Derived state: indexes mirror storage, never the source of truth
//! - Tenant first: every index leads with the tenant field
//! - No silent full scans: an unindexed query is rejected with the index
//!   that would serve it
//! - Deterministic: BTreeMap ordering for entries and index selection

mod btree;
mod definition;
mod errors;
mod manager;
mod planner;
mod query;

pub use btree::{IndexKey, IndexTree, KeyPart, KeyValue};
pub use definition::{Direction, IndexDefinition, IndexField};
pub use errors::{IndexError, IndexResult};
pub use manager::{IndexManager, IndexStats};
pub use planner::{plan_query, QueryPlan};
pub use query::{FilterOp, OrderBy, QuerySpec, WhereClause};
