//! Unified Operation Model
//!
//! Every gateway request is one of these. The tenant is never part of the
//! operation; it comes from the [`RequestContext`](super::RequestContext).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::index::{OrderBy, QuerySpec, WhereClause};
use crate::rules::AccessKind;
use crate::storage::{ReadVersion, TxOperation};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    // Document operations
    Get {
        path: String,
    },
    Create {
        path: String,
        data: Value,
        #[serde(default)]
        idempotency_key: Option<String>,
    },
    Update {
        path: String,
        data: Value,
        #[serde(default)]
        if_version: Option<u64>,
        #[serde(default)]
        merge: bool,
        #[serde(default)]
        idempotency_key: Option<String>,
    },
    Delete {
        path: String,
        #[serde(default)]
        if_version: Option<u64>,
        #[serde(default)]
        idempotency_key: Option<String>,
    },

    // Query operations
    Query(QueryOp),
    Explain(QueryOp),

    /// Apply buffered writes atomically
    Commit {
        /// Reusing an id replays an earlier commit instead of applying twice
        #[serde(default)]
        transaction_id: Option<String>,
        /// Versions the caller read; any that moved aborts the commit
        #[serde(default)]
        reads: Vec<ReadVersion>,
        operations: Vec<TxOperation>,
    },
}

impl Operation {
    /// Get operation name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Query(_) => "query",
            Self::Explain(_) => "explain",
            Self::Commit { .. } => "commit",
        }
    }

    /// The access the rules are asked about. A commit checks each of its
    /// operations separately.
    pub fn access_kind(&self) -> Option<AccessKind> {
        match self {
            Self::Get { .. } => Some(AccessKind::Get),
            Self::Create { .. } => Some(AccessKind::Create),
            Self::Update { .. } => Some(AccessKind::Update),
            Self::Delete { .. } => Some(AccessKind::Delete),
            Self::Query(_) | Self::Explain(_) => Some(AccessKind::List),
            Self::Commit { .. } => None,
        }
    }
}

/// A query without its tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOp {
    pub collection: String,
    #[serde(default, rename = "where")]
    pub filters: Vec<WhereClause>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl QueryOp {
    pub fn for_tenant(&self, tenant: &str) -> QuerySpec {
        QuerySpec {
            collection: self.collection.clone(),
            tenant: tenant.to_string(),
            filters: self.filters.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Direction, FilterOp};

    #[test]
    fn test_operation_parsing() {
        let json = r#"{"op": "get", "path": "orders/o1"}"#;
        let op: Operation = serde_json::from_str(json).unwrap();

        assert_eq!(op.name(), "get");
        assert_eq!(op.access_kind(), Some(AccessKind::Get));
    }

    #[test]
    fn test_query_operation() {
        let json = r#"{
            "op": "query",
            "collection": "orders",
            "where": [{"field": "status", "op": "==", "value": "open"}],
            "orderBy": [{"field": "createdAt", "direction": "desc"}],
            "limit": 10
        }"#;
        let op: Operation = serde_json::from_str(json).unwrap();

        let Operation::Query(query) = op else {
            panic!("Expected Query operation");
        };
        let spec = query.for_tenant("T1");
        assert_eq!(spec.tenant, "T1");
        assert_eq!(spec.filters[0].op, FilterOp::Eq);
        assert_eq!(spec.order_by[0].direction, Direction::Desc);
        assert_eq!(spec.limit, Some(10));
    }

    #[test]
    fn test_commit_operation() {
        let json = r#"{
            "op": "commit",
            "transaction_id": "tx-1",
            "reads": [{"path": "orders/o2", "version": 3}],
            "operations": [
                {"op": "create", "path": "orders/o1", "data": {"total": 5}},
                {"op": "delete", "path": "orders/o2", "if_version": 3}
            ]
        }"#;
        let op: Operation = serde_json::from_str(json).unwrap();

        let Operation::Commit {
            transaction_id,
            reads,
            operations,
        } = op
        else {
            panic!("Expected Commit operation");
        };
        assert_eq!(transaction_id.as_deref(), Some("tx-1"));
        assert_eq!(reads, vec![ReadVersion::new("orders/o2", 3).unwrap()]);
        assert_eq!(operations.len(), 2);
        assert_eq!(operations[1].name(), "delete");
    }
}
