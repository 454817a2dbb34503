//! Index Manager
//!
//! Owns every compound index and keeps it in step with storage.
//!
//! # API
//!
//! - `create_index(storage, definition)` - Declare and backfill an index
//! - `drop_index(name)` / `list_indexes(collection)`
//! - `plan_query(spec)` - Choose an index or reject with a suggestion
//! - `execute_query(storage, spec)` - Ordered scan resolved to documents
//! - `apply_change(change)` - Maintenance, called by storage on commit
//!
//! # Locking
//!
//! Storage is always locked before the index state. Writers reach
//! `apply_change` while holding the storage write lock; backfill and query
//! execution take the storage read lock first. Documents therefore never
//! appear in an index before they are readable, and a query never sees an
//! index entry whose document has moved on.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::IndexConfig;
use crate::observability::Event;
use crate::storage::{ChangeSink, Document, DocumentChange, StorageEngine};

use super::btree::{IndexKey, IndexTree, KeyPart, KeyValue};
use super::definition::IndexDefinition;
use super::errors::{IndexError, IndexResult};
use super::planner::{self, QueryPlan};
use super::query::QuerySpec;

/// Entry counts for one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub name: String,
    pub collection: String,
    pub entries: usize,
    pub keys: usize,
}

struct BuiltIndex {
    definition: IndexDefinition,
    tree: IndexTree,
}

impl BuiltIndex {
    /// Extract the key tuple, or `None` when any indexed field is missing
    /// or not indexable.
    fn key_for(&self, doc: &Document, tenant_field: &str) -> Option<IndexKey> {
        let mut parts = Vec::with_capacity(self.definition.fields.len());
        for field in &self.definition.fields {
            let value = if field.field == tenant_field {
                KeyValue::String(doc.tenant_id.clone())
            } else {
                KeyValue::from_json(&doc.field(&field.field)?)?
            };
            parts.push(KeyPart::new(value, field.direction));
        }
        Some(IndexKey(parts))
    }

    fn insert(&mut self, doc: &Document, tenant_field: &str) {
        if let Some(key) = self.key_for(doc, tenant_field) {
            self.tree.insert(key, doc.path.clone());
        }
    }

    fn remove(&mut self, doc: &Document, tenant_field: &str) {
        if let Some(key) = self.key_for(doc, tenant_field) {
            self.tree.remove(&key, &doc.path);
        }
    }
}

#[derive(Default)]
struct IndexState {
    /// Keyed by index name
    indexes: BTreeMap<String, BuiltIndex>,
}

/// Index Manager that maintains compound indexes
pub struct IndexManager {
    tenant_field: String,
    state: RwLock<IndexState>,
}

impl IndexManager {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            tenant_field: config.tenant_field,
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn tenant_field(&self) -> &str {
        &self.tenant_field
    }

    /// Declare an index and populate it from every existing document of
    /// its collection, across all tenants.
    ///
    /// Returns the stored definition, with the tenant field first.
    pub fn create_index(
        &self,
        storage: &StorageEngine,
        definition: IndexDefinition,
    ) -> IndexResult<IndexDefinition> {
        let definition = definition.normalized(&self.tenant_field)?;
        let collection = definition.collection.clone();

        storage.with_collection(&collection, |docs| {
            let mut state = self.state.write();
            if state.indexes.contains_key(&definition.name) {
                return Err(IndexError::IndexExists(definition.name.clone()));
            }

            let mut built = BuiltIndex {
                definition: definition.clone(),
                tree: IndexTree::new(),
            };
            for doc in docs {
                built.insert(doc, &self.tenant_field);
            }

            info!(
                event = Event::IndexCreated.as_str(),
                index = definition.name.as_str(),
                collection = collection.as_str(),
                scanned = docs.len(),
                entries = built.tree.entry_count(),
                "index created"
            );
            state.indexes.insert(definition.name.clone(), built);
            Ok(definition)
        })
    }

    /// Remove an index and its entries.
    pub fn drop_index(&self, name: &str) -> IndexResult<IndexDefinition> {
        let removed = self
            .state
            .write()
            .indexes
            .remove(name)
            .ok_or_else(|| IndexError::IndexNotFound(name.to_string()))?;

        info!(
            event = Event::IndexDropped.as_str(),
            index = name,
            "index dropped"
        );
        Ok(removed.definition)
    }

    /// Definitions declared on `collection`, by name.
    pub fn list_indexes(&self, collection: &str) -> Vec<IndexDefinition> {
        self.state
            .read()
            .indexes
            .values()
            .filter(|index| index.definition.collection == collection)
            .map(|index| index.definition.clone())
            .collect()
    }

    pub fn stats(&self) -> Vec<IndexStats> {
        self.state
            .read()
            .indexes
            .values()
            .map(|index| IndexStats {
                name: index.definition.name.clone(),
                collection: index.definition.collection.clone(),
                entries: index.tree.entry_count(),
                keys: index.tree.key_count(),
            })
            .collect()
    }

    /// Choose the index that serves `spec`.
    pub fn plan_query(&self, spec: &QuerySpec) -> IndexResult<QueryPlan> {
        let state = self.state.read();
        let result = planner::plan_query(
            spec,
            state.indexes.values().map(|index| &index.definition),
            &self.tenant_field,
        );

        match &result {
            Ok(plan) => debug!(
                event = Event::QueryPlanned.as_str(),
                tenant = spec.tenant.as_str(),
                collection = spec.collection.as_str(),
                index = plan.index_name.as_str(),
                score = plan.score,
                "query planned"
            ),
            Err(err) => warn!(
                event = Event::QueryRejected.as_str(),
                tenant = spec.tenant.as_str(),
                collection = spec.collection.as_str(),
                error = %err,
                "query rejected"
            ),
        }
        result
    }

    /// Plan and run `spec`, returning documents in index order.
    pub fn execute_query(
        &self,
        storage: &StorageEngine,
        spec: &QuerySpec,
    ) -> IndexResult<Vec<Document>> {
        let plan = self.plan_query(spec)?;
        self.execute_plan(storage, &plan)
    }

    /// Run a plan produced by [`plan_query`](Self::plan_query).
    pub fn execute_plan(
        &self,
        storage: &StorageEngine,
        plan: &QueryPlan,
    ) -> IndexResult<Vec<Document>> {
        if plan.bounds.unsatisfiable {
            return Ok(Vec::new());
        }
        let limit = plan.limit.unwrap_or(usize::MAX);

        storage.read_view(|view| {
            let state = self.state.read();
            let index = state
                .indexes
                .get(&plan.index_name)
                .ok_or_else(|| IndexError::IndexNotFound(plan.index_name.clone()))?;

            let documents: Vec<Document> = index
                .tree
                .scan(
                    plan.bounds.prefix.clone(),
                    plan.bounds.lower.clone(),
                    plan.bounds.upper.clone(),
                )
                .filter(|(key, _)| plan.bounds.matches(key))
                .filter_map(|(_, path)| view.get(&plan.tenant, path).cloned())
                .take(limit)
                .collect();
            Ok(documents)
        })
    }
}

impl ChangeSink for IndexManager {
    /// Remove the old entry and insert the new one in every index on the
    /// changed collection.
    fn apply_change(&self, change: &DocumentChange) {
        let collection = change.collection();
        let mut state = self.state.write();
        for index in state
            .indexes
            .values_mut()
            .filter(|index| index.definition.collection == collection)
        {
            if let Some(before) = &change.before {
                index.remove(before, &self.tenant_field);
            }
            if let Some(after) = &change.after {
                index.insert(after, &self.tenant_field);
            }
        }
    }
}
