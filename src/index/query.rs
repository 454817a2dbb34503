//! Query structures
//!
//! A query names one collection and one tenant, plus equality and range
//! where-clauses, order-by clauses and an optional limit.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::definition::Direction;

/// Where-clause operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
}

impl FilterOp {
    pub fn is_equality(&self) -> bool {
        matches!(self, FilterOp::Eq)
    }

    pub fn is_range(&self) -> bool {
        !self.is_equality()
    }

    /// Whether the operator bounds the value from below (`>`, `>=`).
    pub fn is_lower_bound(&self) -> bool {
        matches!(self, FilterOp::Gt | FilterOp::Gte)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "==",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
        }
    }
}

/// A single where-clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhereClause {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl fmt::Display for WhereClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.op.as_str(), self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

/// A query against one collection for one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    pub collection: String,
    pub tenant: String,
    #[serde(default, rename = "where")]
    pub filters: Vec<WhereClause>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl QuerySpec {
    pub fn new(collection: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            tenant: tenant.into(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.filters.push(WhereClause {
            field: field.into(),
            op,
            value,
        });
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: Value) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
