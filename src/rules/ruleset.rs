//! Rule sets
//!
//! Rules are declared as data (JSON or TOML), compiled once into a trie, and
//! never mutated afterwards.
//!
//! ```toml
//! [[rules]]
//! name = "members-read-orders"
//! path = "tenants/{tenantId}/orders/{orderId}"
//! operations = ["read"]
//! condition = "isSignedIn() && callerTenant() == tenantId"
//! priority = 10
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::observability::Event;

use super::context::AccessKind;
use super::errors::{RulesError, RulesResult};
use super::expr::{self, Expr};
use super::trie::{PatternSyntax, RuleTrie, Segment, TrieMatch};

/// A rule as declared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    #[serde(default)]
    pub name: Option<String>,
    /// Path pattern, e.g. `tenants/{tenantId}/orders/{orderId}`
    #[serde(alias = "match")]
    pub path: String,
    /// Operation names; `read` and `write` are accepted as groups
    pub operations: Vec<String>,
    pub condition: String,
    /// Lower numbers are evaluated first
    #[serde(default)]
    pub priority: i32,
}

impl RuleDefinition {
    pub fn new(
        path: impl Into<String>,
        operations: &[&str],
        condition: impl Into<String>,
    ) -> Self {
        Self {
            name: None,
            path: path.into(),
            operations: operations.iter().map(|op| op.to_string()).collect(),
            condition: condition.into(),
            priority: 0,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Deserialize)]
struct RuleSetDocument {
    #[serde(default)]
    rules: Vec<RuleDefinition>,
}

/// A compiled rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub pattern: String,
    pub operations: Vec<AccessKind>,
    pub priority: i32,
    pub(crate) condition: Expr,
}

impl Rule {
    pub fn governs(&self, operation: AccessKind) -> bool {
        self.operations.contains(&operation)
    }
}

/// An immutable, compiled set of rules
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    trie: RuleTrie,
}

impl RuleSet {
    /// No rules: every request is denied.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile declared rules. Any malformed pattern, condition or function
    /// call fails the whole load.
    pub fn compile(definitions: Vec<RuleDefinition>) -> RulesResult<Self> {
        let syntax = PatternSyntax::new()?;
        let mut rules = Vec::with_capacity(definitions.len());
        let mut trie = RuleTrie::new();

        for (index, definition) in definitions.into_iter().enumerate() {
            let name = definition
                .name
                .clone()
                .unwrap_or_else(|| format!("rule-{}", index));

            let segments = syntax.parse(&definition.path)?;
            let bound: HashSet<String> = segments
                .iter()
                .filter_map(|segment| match segment {
                    Segment::Variable(name) => Some(name.clone()),
                    Segment::Literal(_) => None,
                })
                .collect();

            let mut operations = Vec::new();
            for declared in &definition.operations {
                let expanded = AccessKind::expand(declared).ok_or_else(|| {
                    RulesError::InvalidRuleSet(format!(
                        "rule '{}' names unknown operation '{}'",
                        name, declared
                    ))
                })?;
                for op in expanded {
                    if !operations.contains(op) {
                        operations.push(*op);
                    }
                }
            }
            if operations.is_empty() {
                return Err(RulesError::InvalidRuleSet(format!(
                    "rule '{}' governs no operations",
                    name
                )));
            }

            let condition = expr::parse(&name, &definition.condition, &bound)?;
            trie.insert(&definition.path, &segments, index)?;
            rules.push(Rule {
                name,
                pattern: definition.path,
                operations,
                priority: definition.priority,
                condition,
            });
        }

        trie.sort_rules_by(&|id: usize| (rules[id].priority, id));

        info!(
            event = Event::RulesLoaded.as_str(),
            rules = rules.len(),
            "rule set compiled"
        );
        Ok(Self { rules, trie })
    }

    pub fn from_json(text: &str) -> RulesResult<Self> {
        let document: RuleSetDocument =
            serde_json::from_str(text).map_err(|e| RulesError::InvalidRuleSet(e.to_string()))?;
        Self::compile(document.rules)
    }

    pub fn from_toml(text: &str) -> RulesResult<Self> {
        let document: RuleSetDocument =
            toml::from_str(text).map_err(|e| RulesError::InvalidRuleSet(e.to_string()))?;
        Self::compile(document.rules)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub(crate) fn rule(&self, id: usize) -> &Rule {
        &self.rules[id]
    }

    pub(crate) fn route(&self, segments: &[&str]) -> Option<TrieMatch<'_>> {
        self.trie.lookup(segments)
    }
}
