//! # Rules
//!
//! Declarative, path-scoped access rules.
//!
//! - Rules are compiled once into a trie keyed by path segment
//! - Candidates are evaluated in priority order and the first that holds wins
//! - No matching rule means deny
//! - Decisions that depend only on the caller are cached for a short TTL

mod context;
mod errors;
mod evaluator;
mod expr;
mod functions;
mod ruleset;
mod trie;

pub use context::{AccessKind, AuthClaims, EvaluationContext, ResourceLookup};
pub use errors::{RulesError, RulesResult};
pub use evaluator::{Decision, RulesEvaluator};
pub use functions::Builtin;
pub use ruleset::{Rule, RuleDefinition, RuleSet};
