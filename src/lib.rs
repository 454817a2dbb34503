//! tenantdb - the storage and access-control core of a multi-tenant
//! document database
//!
//! - [`storage`]: tenant-partitioned documents with optimistic concurrency,
//!   idempotent writes, bounded transactions and an append-only change log
//! - [`index`]: compound indexes with the tenant field first, and a planner
//!   that refuses queries no index can serve
//! - [`rules`]: declarative path-scoped access rules, default deny
//! - [`core`]: the gateway that authorizes and dispatches requests

pub mod cache;
pub mod config;
pub mod core;
pub mod index;
pub mod observability;
pub mod rules;
pub mod storage;

pub use crate::config::DatabaseConfig;
pub use crate::core::{Database, Error, Operation, Outcome, RequestContext, Result};
