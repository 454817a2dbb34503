//! Index Planning Tests
//!
//! Tests for index invariants:
//! - The tenant field always leads an index
//! - Equality clauses match in any declared order
//! - Two range clauses are always refused
//! - Unserved queries fail with a usable suggestion
//! - Scans are tenant-scoped and ordered

use std::sync::Arc;

use serde_json::json;
use tenantdb::config::{IndexConfig, StorageConfig};
use tenantdb::index::{Direction, FilterOp, IndexDefinition, IndexError, IndexManager, QuerySpec};
use tenantdb::storage::{DeleteOptions, Document, StorageEngine, UpdateOptions, WriteOptions};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup() -> (Arc<IndexManager>, StorageEngine) {
    let indexes = Arc::new(IndexManager::new(IndexConfig::default()));
    let storage = StorageEngine::with_sink(StorageConfig::default(), indexes.clone());
    (indexes, storage)
}

fn status_by_created() -> IndexDefinition {
    IndexDefinition::new("orders_status_created", "orders")
        .asc("status")
        .desc("createdAt")
}

fn put(storage: &StorageEngine, tenant: &str, id: &str, data: serde_json::Value) -> Document {
    storage
        .create(&format!("orders/{id}"), data, tenant, "test", WriteOptions::default())
        .unwrap()
}

fn ids(docs: &[Document]) -> Vec<&str> {
    docs.iter().map(|d| d.id.as_str()).collect()
}

// =============================================================================
// Definition Tests
// =============================================================================

/// The tenant field is inserted first when omitted.
#[test]
fn test_tenant_field_forced_first() {
    let (indexes, storage) = setup();
    let def = indexes.create_index(&storage, status_by_created()).unwrap();
    let fields: Vec<&str> = def.field_names().collect();
    assert_eq!(fields, vec!["tenantId", "status", "createdAt"]);
}

/// Naming the tenant field anywhere but first is rejected.
#[test]
fn test_misplaced_tenant_field_rejected() {
    let (indexes, storage) = setup();
    let err = indexes
        .create_index(
            &storage,
            IndexDefinition::new("bad", "orders").asc("status").asc("tenantId"),
        )
        .unwrap_err();
    assert!(matches!(err, IndexError::InvalidDefinition(_)));
}

/// Duplicate index names are refused.
#[test]
fn test_duplicate_name_rejected() {
    let (indexes, storage) = setup();
    indexes.create_index(&storage, status_by_created()).unwrap();
    let err = indexes.create_index(&storage, status_by_created()).unwrap_err();
    assert_eq!(err.code(), "INDEX_EXISTS");
}

// =============================================================================
// Matching Tests
// =============================================================================

/// The suggested index for an unserved query leads with the tenant field.
#[test]
fn test_unindexed_query_suggests_fix() {
    let (indexes, _storage) = setup();
    let spec = QuerySpec::new("orders", "T1")
        .where_eq("status", json!("open"))
        .order_by("createdAt", Direction::Desc);

    let err = indexes.plan_query(&spec).unwrap_err();
    assert_eq!(err.code(), "QUERY_NOT_INDEXED");
    let suggested = err.suggested_index().unwrap();
    let fields: Vec<(&str, Direction)> = suggested
        .fields
        .iter()
        .map(|f| (f.field.as_str(), f.direction))
        .collect();
    assert_eq!(
        fields,
        vec![
            ("tenantId", Direction::Asc),
            ("status", Direction::Asc),
            ("createdAt", Direction::Desc),
        ]
    );
}

/// Creating the suggested index makes the query plannable.
#[test]
fn test_suggestion_is_usable() {
    let (indexes, storage) = setup();
    let spec = QuerySpec::new("orders", "T1")
        .where_eq("status", json!("open"))
        .order_by("createdAt", Direction::Desc);

    let suggested = indexes.plan_query(&spec).unwrap_err().suggested_index().cloned().unwrap();
    indexes.create_index(&storage, suggested.clone()).unwrap();

    let plan = indexes.plan_query(&spec).unwrap();
    assert_eq!(plan.index_name, suggested.name);
    assert_eq!(plan.score, 10 + 3);
}

/// Equality clauses match regardless of declaration order.
#[test]
fn test_equality_order_irrelevant() {
    let (indexes, storage) = setup();
    indexes
        .create_index(
            &storage,
            IndexDefinition::new("by_region_status", "orders")
                .asc("region")
                .asc("status"),
        )
        .unwrap();

    let forward = QuerySpec::new("orders", "T1")
        .where_eq("region", json!("eu"))
        .where_eq("status", json!("open"));
    let backward = QuerySpec::new("orders", "T1")
        .where_eq("status", json!("open"))
        .where_eq("region", json!("eu"));

    assert_eq!(indexes.plan_query(&forward).unwrap().index_name, "by_region_status");
    assert_eq!(indexes.plan_query(&backward).unwrap().index_name, "by_region_status");
}

/// Two range clauses are refused even with a seemingly fitting index.
#[test]
fn test_two_ranges_rejected() {
    let (indexes, storage) = setup();
    indexes
        .create_index(
            &storage,
            IndexDefinition::new("by_total_created", "orders")
                .asc("total")
                .asc("createdAt"),
        )
        .unwrap();

    let spec = QuerySpec::new("orders", "T1")
        .filter("total", FilterOp::Gt, json!(10))
        .filter("createdAt", FilterOp::Lt, json!("2030-01-01"));
    let err = indexes.plan_query(&spec).unwrap_err();
    assert!(matches!(err, IndexError::QueryNotIndexed { .. }));
}

/// The highest-scoring candidate wins.
#[test]
fn test_best_score_wins() {
    let (indexes, storage) = setup();
    indexes
        .create_index(&storage, IndexDefinition::new("by_status", "orders").asc("status"))
        .unwrap();
    indexes.create_index(&storage, status_by_created()).unwrap();

    let spec = QuerySpec::new("orders", "T1")
        .where_eq("status", json!("open"))
        .order_by("createdAt", Direction::Desc);
    let plan = indexes.plan_query(&spec).unwrap();
    assert_eq!(plan.index_name, "orders_status_created");
    assert!(plan.to_string().starts_with("INDEX SCAN orders_status_created on orders"));
}

/// A wrong order-by direction does not match.
#[test]
fn test_direction_must_match() {
    let (indexes, storage) = setup();
    indexes.create_index(&storage, status_by_created()).unwrap();

    let spec = QuerySpec::new("orders", "T1")
        .where_eq("status", json!("open"))
        .order_by("createdAt", Direction::Asc);
    assert!(indexes.plan_query(&spec).is_err());
}

// =============================================================================
// Execution Tests
// =============================================================================

/// Results are tenant-scoped and follow index order.
#[test]
fn test_scan_tenant_scoped_and_ordered() {
    let (indexes, storage) = setup();
    indexes.create_index(&storage, status_by_created()).unwrap();

    put(&storage, "T1", "a", json!({"status": "open"}));
    put(&storage, "T2", "x", json!({"status": "open"}));
    put(&storage, "T1", "b", json!({"status": "closed"}));
    put(&storage, "T1", "c", json!({"status": "open"}));

    let spec = QuerySpec::new("orders", "T1")
        .where_eq("status", json!("open"))
        .order_by("createdAt", Direction::Desc);
    let docs = indexes.execute_query(&storage, &spec).unwrap();
    assert_eq!(ids(&docs), vec!["c", "a"]);

    let limited = indexes.execute_query(&storage, &spec.clone().limit(1)).unwrap();
    assert_eq!(ids(&limited), vec!["c"]);
}

/// Range scans return only values inside the bounds.
#[test]
fn test_range_scan() {
    let (indexes, storage) = setup();
    indexes
        .create_index(&storage, IndexDefinition::new("by_total", "orders").asc("total"))
        .unwrap();
    for (id, total) in [("a", 5), ("b", 10), ("c", 15), ("d", 20)] {
        put(&storage, "T1", id, json!({"total": total}));
    }

    let spec = QuerySpec::new("orders", "T1")
        .filter("total", FilterOp::Gt, json!(5))
        .filter("total", FilterOp::Lte, json!(15));
    // two clauses on the same field still count as two ranges
    assert!(indexes.plan_query(&spec).is_err());

    let spec = QuerySpec::new("orders", "T1").filter("total", FilterOp::Gte, json!(10));
    let docs = indexes.execute_query(&storage, &spec).unwrap();
    assert_eq!(ids(&docs), vec!["b", "c", "d"]);

    let spec = QuerySpec::new("orders", "T1").filter("total", FilterOp::Lt, json!(10));
    let docs = indexes.execute_query(&storage, &spec).unwrap();
    assert_eq!(ids(&docs), vec!["a"]);
}

/// Updates and deletes keep the index in step with storage.
#[test]
fn test_index_follows_writes() {
    let (indexes, storage) = setup();
    indexes
        .create_index(&storage, IndexDefinition::new("by_status", "orders").asc("status"))
        .unwrap();
    put(&storage, "T1", "a", json!({"status": "open"}));
    put(&storage, "T1", "b", json!({"status": "open"}));

    storage
        .update("orders/a", json!({"status": "closed"}), "T1", "u", UpdateOptions::new())
        .unwrap();
    storage.delete("orders/b", "T1", "u", DeleteOptions::new()).unwrap();

    let open = QuerySpec::new("orders", "T1").where_eq("status", json!("open"));
    assert!(indexes.execute_query(&storage, &open).unwrap().is_empty());

    let closed = QuerySpec::new("orders", "T1").where_eq("status", json!("closed"));
    assert_eq!(ids(&indexes.execute_query(&storage, &closed).unwrap()), vec!["a"]);
}

/// Racing update and delete bursts leave no stale index entries.
#[test]
fn test_index_consistent_under_concurrent_writes() {
    let (indexes, storage) = setup();
    indexes
        .create_index(&storage, IndexDefinition::new("by_status", "orders").asc("status"))
        .unwrap();
    for i in 0..64 {
        put(&storage, "T1", &format!("o{i}"), json!({"status": "open"}));
    }

    std::thread::scope(|scope| {
        for worker in 0..8 {
            let storage = &storage;
            scope.spawn(move || {
                for round in 0..50 {
                    let path = format!("orders/o{}", (worker * 7 + round * 3) % 64);
                    if round % 10 == 9 {
                        storage.delete(&path, "T1", "w", DeleteOptions::new()).unwrap();
                    } else {
                        let status = if round % 2 == 0 { "closed" } else { "open" };
                        // another worker may already have deleted it
                        let _ = storage.update(
                            &path,
                            json!({"status": status}),
                            "T1",
                            "w",
                            UpdateOptions::new(),
                        );
                    }
                }
            });
        }
    });

    let stored = storage.scan_collection("orders", Some("T1"));
    let entries: usize = indexes.stats().iter().map(|s| s.entries).sum();
    assert_eq!(entries, stored.len());

    for status in ["open", "closed"] {
        let spec = QuerySpec::new("orders", "T1").where_eq("status", json!(status));
        let mut found: Vec<String> = indexes
            .execute_query(&storage, &spec)
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        let mut expected: Vec<String> = stored
            .iter()
            .filter(|d| d.data["status"] == status)
            .map(|d| d.id.clone())
            .collect();
        found.sort();
        expected.sort();
        assert_eq!(found, expected);
    }
}

/// Dropping an index makes its queries unplannable again.
#[test]
fn test_drop_index() {
    let (indexes, storage) = setup();
    indexes
        .create_index(&storage, IndexDefinition::new("by_status", "orders").asc("status"))
        .unwrap();
    assert_eq!(indexes.list_indexes("orders").len(), 1);

    indexes.drop_index("by_status").unwrap();
    assert!(indexes.list_indexes("orders").is_empty());
    assert_eq!(indexes.drop_index("by_status").unwrap_err().code(), "INDEX_NOT_FOUND");

    let spec = QuerySpec::new("orders", "T1").where_eq("status", json!("open"));
    assert!(indexes.plan_query(&spec).is_err());
}
