//! Path-pattern trie
//!
//! Literal segments are labeled edges; a `{variable}` segment is the single
//! variable edge of its node. Matching walks one segment per level,
//! preferring the literal edge and falling back to the variable edge, so
//! routing costs O(path length) regardless of how many rules exist.

use std::collections::HashMap;

use regex::Regex;

use super::errors::{RulesError, RulesResult};

/// One segment of a rule's path pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Variable(String),
}

/// Segment grammar, compiled once per rule-set load.
pub(crate) struct PatternSyntax {
    variable: Regex,
    literal: Regex,
}

impl PatternSyntax {
    pub fn new() -> RulesResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| RulesError::InvalidRuleSet(e.to_string()))
        };
        Ok(Self {
            variable: compile(r"^\{([A-Za-z_][A-Za-z0-9_]*)\}$")?,
            literal: compile(r"^[^{}/\s]+$")?,
        })
    }

    /// Split and validate a pattern such as `tenants/{tenantId}/orders/{id}`.
    pub fn parse(&self, pattern: &str) -> RulesResult<Vec<Segment>> {
        let invalid = |reason: String| RulesError::InvalidPathPattern {
            pattern: pattern.to_string(),
            reason,
        };

        let trimmed = pattern.trim_matches('/');
        if trimmed.is_empty() {
            return Err(invalid("pattern is empty".into()));
        }

        let mut segments = Vec::new();
        for raw in trimmed.split('/') {
            if let Some(captures) = self.variable.captures(raw) {
                let name = captures[1].to_string();
                if segments.contains(&Segment::Variable(name.clone())) {
                    return Err(invalid(format!("variable '{}' is bound twice", name)));
                }
                segments.push(Segment::Variable(name));
            } else if self.literal.is_match(raw) {
                segments.push(Segment::Literal(raw.to_string()));
            } else {
                return Err(invalid(format!("'{}' is not a valid segment", raw)));
            }
        }
        Ok(segments)
    }
}

#[derive(Debug, Default)]
struct Node {
    literals: HashMap<String, Node>,
    variable: Option<(String, Box<Node>)>,
    /// Rule ids, kept in evaluation order
    rules: Vec<usize>,
}

/// Rules routed by path
#[derive(Debug, Default)]
pub(crate) struct RuleTrie {
    root: Node,
}

/// Rules attached to a matched path, plus the bound variables.
#[derive(Debug, PartialEq)]
pub(crate) struct TrieMatch<'t> {
    pub rules: &'t [usize],
    pub bindings: HashMap<String, String>,
}

impl RuleTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `rule` at `segments`. A second variable name at a depth that
    /// already has a variable edge is rejected.
    pub fn insert(&mut self, pattern: &str, segments: &[Segment], rule: usize) -> RulesResult<()> {
        let mut node = &mut self.root;
        for segment in segments {
            node = match segment {
                Segment::Literal(label) => node.literals.entry(label.clone()).or_default(),
                Segment::Variable(name) => {
                    let (existing, child) = node
                        .variable
                        .get_or_insert_with(|| (name.clone(), Box::default()));
                    if *existing != *name {
                        return Err(RulesError::ConflictingVariable {
                            pattern: pattern.to_string(),
                            existing: existing.clone(),
                            found: name.clone(),
                        });
                    }
                    child.as_mut()
                }
            };
        }
        node.rules.push(rule);
        Ok(())
    }

    /// Sort every node's rules by `key`.
    pub fn sort_rules_by<K: Ord>(&mut self, key: &impl Fn(usize) -> K) {
        fn visit<K: Ord>(node: &mut Node, key: &impl Fn(usize) -> K) {
            node.rules.sort_by_key(|rule| key(*rule));
            for child in node.literals.values_mut() {
                visit(child, key);
            }
            if let Some((_, child)) = node.variable.as_mut() {
                visit(child, key);
            }
        }
        visit(&mut self.root, key);
    }

    /// Find the rules for `segments`.
    ///
    /// A literal edge is tried first; if that branch has no rules for the
    /// full path, the variable edge is tried instead. A literal branch that
    /// has rules wins even when none of them governs the requested
    /// operation.
    pub fn lookup<'t>(&'t self, segments: &[&str]) -> Option<TrieMatch<'t>> {
        let mut bindings = HashMap::new();
        let rules = Self::descend(&self.root, segments, &mut bindings)?;
        Some(TrieMatch { rules, bindings })
    }

    fn descend<'t>(
        node: &'t Node,
        segments: &[&str],
        bindings: &mut HashMap<String, String>,
    ) -> Option<&'t [usize]> {
        let Some((head, rest)) = segments.split_first() else {
            return (!node.rules.is_empty()).then_some(node.rules.as_slice());
        };

        if let Some(child) = node.literals.get(*head) {
            if let Some(rules) = Self::descend(child, rest, bindings) {
                return Some(rules);
            }
        }

        let (name, child) = node.variable.as_ref()?;
        let rules = Self::descend(child, rest, bindings)?;
        bindings.insert(name.clone(), head.to_string());
        Some(rules)
    }
}
