//! Rules error types
//!
//! All of these are raised while loading a rule set. Evaluation itself never
//! fails: a deny is a result, and a condition that cannot be evaluated counts
//! as false.

use thiserror::Error;

/// Result type for rule loading
pub type RulesResult<T> = Result<T, RulesError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RulesError {
    #[error("Rule '{rule}' calls unknown function '{name}'")]
    UnknownFunction { rule: String, name: String },

    #[error("Rule '{rule}' calls {name}() with {found} arguments, expected {expected}")]
    ArityMismatch {
        rule: String,
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("Invalid path pattern '{pattern}': {reason}")]
    InvalidPathPattern { pattern: String, reason: String },

    /// Two patterns bind different variable names at the same depth
    #[error("Pattern '{pattern}' binds '{{{found}}}' where another rule binds '{{{existing}}}'")]
    ConflictingVariable {
        pattern: String,
        existing: String,
        found: String,
    },

    #[error("Syntax error in rule '{rule}' at offset {position}: {message}")]
    ConditionSyntax {
        rule: String,
        position: usize,
        message: String,
    },

    #[error("Invalid rule set: {0}")]
    InvalidRuleSet(String),
}

impl RulesError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            RulesError::UnknownFunction { .. } => "UNKNOWN_FUNCTION",
            RulesError::ArityMismatch { .. } => "ARITY_MISMATCH",
            RulesError::InvalidPathPattern { .. } => "INVALID_PATH_PATTERN",
            RulesError::ConflictingVariable { .. } => "CONFLICTING_VARIABLE",
            RulesError::ConditionSyntax { .. } => "CONDITION_SYNTAX",
            RulesError::InvalidRuleSet(_) => "INVALID_RULE_SET",
        }
    }

    /// Rule-load errors are configuration mistakes, never request errors.
    pub fn is_client_error(&self) -> bool {
        false
    }
}
