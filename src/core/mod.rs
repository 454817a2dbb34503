//! # Core
//!
//! The request gateway. Every request routes through [`Database::execute`]:
//! rules first, then storage or the index system.

pub mod context;
pub mod database;
pub mod error;
pub mod operation;

pub use context::RequestContext;
pub use database::{Database, Outcome, SweepReport};
pub use error::{Error, Result};
pub use operation::{Operation, QueryOp};
