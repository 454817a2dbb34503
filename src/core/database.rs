//! Request gateway
//!
//! `Database` wires the storage engine, the index manager and the rules
//! evaluator together. The index manager is installed as the storage
//! engine's change sink, so every committed write reaches the indexes
//! before the write call returns.
//!
//! Every [`Operation`] passes the rules first. The evaluation sees the
//! document currently stored at the path (if any), the incoming payload and
//! the request tenant; a deny becomes [`Error::AccessDenied`] and nothing is
//! executed.
//!
//! # Partitions
//!
//! A request only ever touches `ctx.tenant`. Before any rule runs:
//! - a caller whose claims name a tenant may only act in that tenant;
//! - a path rooted at `tenants/{id}` must name the request tenant.
//!
//! Queries are authorized as `list` on `tenants/{tenant}/{collection}`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::DatabaseConfig;
use crate::index::{IndexDefinition, IndexManager, QueryPlan};
use crate::observability::Event;
use crate::rules::{AccessKind, EvaluationContext, ResourceLookup, RuleSet, RulesEvaluator};
use crate::storage::{
    ChangeSink, CommitReceipt, DeleteOptions, Document, DocumentPath, ReadVersion,
    StorageEngine, StorageError, TxOperation, UpdateOptions, WriteOptions,
};

use super::context::RequestContext;
use super::error::{Error, Result};
use super::operation::Operation;

/// Result of a successful [`Database::execute`]
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Document(Document),
    Deleted { existed: bool },
    Documents(Vec<Document>),
    Plan(QueryPlan),
    Committed(CommitReceipt),
}

/// Entries removed by one maintenance sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub idempotency: usize,
    pub decisions: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.idempotency + self.decisions
    }
}

/// Root collection whose ids name tenants
const TENANT_ROOT: &str = "tenants";

/// The tenant named by a `tenants/{id}/...` path.
fn path_tenant(path: &str) -> Option<&str> {
    let mut segments = path.trim_matches('/').split('/');
    match (segments.next(), segments.next()) {
        (Some(TENANT_ROOT), Some(tenant)) => Some(tenant),
        _ => None,
    }
}

/// Path a query is authorized against.
fn list_path(tenant: &str, collection: &str) -> String {
    format!("{}/{}/{}", TENANT_ROOT, tenant, collection.trim_matches('/'))
}

/// `exists()` probe scoped to the requesting tenant
struct TenantLookup<'a> {
    storage: &'a StorageEngine,
    tenant: &'a str,
}

impl ResourceLookup for TenantLookup<'_> {
    fn exists(&self, path: &str) -> bool {
        DocumentPath::parse(path)
            .map(|path| self.storage.find(&path, self.tenant).is_some())
            .unwrap_or(false)
    }
}

pub struct Database {
    config: DatabaseConfig,
    storage: StorageEngine,
    indexes: Arc<IndexManager>,
    rules: RwLock<Arc<RulesEvaluator>>,
}

impl Database {
    /// A database with no rules. Only service requests succeed until rules
    /// are loaded.
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        Self::with_rules(config, RuleSet::empty())
    }

    pub fn with_rules(config: DatabaseConfig, rules: RuleSet) -> Result<Self> {
        config.validate()?;

        let indexes = Arc::new(IndexManager::new(config.index.clone()));
        let sink: Arc<dyn ChangeSink> = indexes.clone();
        let storage = StorageEngine::with_sink(config.storage.clone(), sink);
        let rules = RulesEvaluator::new(rules, &config.rules);

        Ok(Self {
            config,
            storage,
            indexes,
            rules: RwLock::new(Arc::new(rules)),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    pub fn rules(&self) -> Arc<RulesEvaluator> {
        Arc::clone(&self.rules.read())
    }

    /// Swap in a new rule set. Requests already evaluating keep the old one.
    pub fn load_rules(&self, rules: RuleSet) {
        let evaluator = RulesEvaluator::new(rules, &self.config.rules);
        *self.rules.write() = Arc::new(evaluator);
    }

    pub fn create_index(&self, definition: IndexDefinition) -> Result<IndexDefinition> {
        Ok(self.indexes.create_index(&self.storage, definition)?)
    }

    pub fn drop_index(&self, name: &str) -> Result<IndexDefinition> {
        Ok(self.indexes.drop_index(name)?)
    }

    /// Authorize and run one operation for `ctx.tenant`.
    pub fn execute(&self, op: Operation, ctx: &RequestContext) -> Result<Outcome> {
        let name = op.name();
        let result = self.dispatch(op, ctx);

        match &result {
            Ok(_) => debug!(
                request_id = %ctx.request_id,
                tenant = ctx.tenant.as_str(),
                operation = name,
                elapsed_ms = ctx.elapsed_ms() as u64,
                "request completed"
            ),
            Err(err) => debug!(
                request_id = %ctx.request_id,
                tenant = ctx.tenant.as_str(),
                operation = name,
                code = err.code(),
                error = %err,
                "request failed"
            ),
        }
        result
    }

    fn dispatch(&self, op: Operation, ctx: &RequestContext) -> Result<Outcome> {
        let tenant = ctx.tenant.as_str();
        let actor = ctx.actor();

        match op {
            Operation::Get { path } => {
                let current = self.current(&path, tenant)?;
                self.authorize(AccessKind::Get, &path, current.as_ref(), None, ctx)?;
                let doc = current.ok_or_else(|| StorageError::not_found(tenant, path))?;
                Ok(Outcome::Document(doc))
            }
            Operation::Create {
                path,
                data,
                idempotency_key,
            } => {
                let current = self.current(&path, tenant)?;
                self.authorize(AccessKind::Create, &path, current.as_ref(), Some(&data), ctx)?;
                let options = WriteOptions { idempotency_key };
                let doc = self.storage.create(&path, data, tenant, actor, options)?;
                Ok(Outcome::Document(doc))
            }
            Operation::Update {
                path,
                data,
                if_version,
                merge,
                idempotency_key,
            } => {
                let current = self.current(&path, tenant)?;
                self.authorize(AccessKind::Update, &path, current.as_ref(), Some(&data), ctx)?;
                let options = UpdateOptions {
                    if_version,
                    idempotency_key,
                    merge,
                };
                let doc = self.storage.update(&path, data, tenant, actor, options)?;
                Ok(Outcome::Document(doc))
            }
            Operation::Delete {
                path,
                if_version,
                idempotency_key,
            } => {
                let current = self.current(&path, tenant)?;
                self.authorize(AccessKind::Delete, &path, current.as_ref(), None, ctx)?;
                let options = DeleteOptions {
                    if_version,
                    idempotency_key,
                };
                let existed = self.storage.delete(&path, tenant, actor, options)?;
                Ok(Outcome::Deleted { existed })
            }
            Operation::Query(query) => {
                let path = list_path(tenant, &query.collection);
                self.authorize(AccessKind::List, &path, None, None, ctx)?;
                let spec = query.for_tenant(tenant);
                let documents = self.indexes.execute_query(&self.storage, &spec)?;
                Ok(Outcome::Documents(documents))
            }
            Operation::Explain(query) => {
                let path = list_path(tenant, &query.collection);
                self.authorize(AccessKind::List, &path, None, None, ctx)?;
                let plan = self.indexes.plan_query(&query.for_tenant(tenant))?;
                Ok(Outcome::Plan(plan))
            }
            Operation::Commit {
                transaction_id,
                reads,
                operations,
            } => self.commit(transaction_id, reads, operations, ctx),
        }
    }

    fn commit(
        &self,
        transaction_id: Option<String>,
        reads: Vec<ReadVersion>,
        operations: Vec<TxOperation>,
        ctx: &RequestContext,
    ) -> Result<Outcome> {
        let tenant = ctx.tenant.as_str();
        let mut tx = match transaction_id.as_deref() {
            Some(id) => self.storage.begin_transaction_with_id(tenant, id),
            None => self.storage.begin_transaction(tenant),
        };

        // A declared read is a claim to have read the document.
        for read in reads {
            let current = self.storage.find(&read.path, tenant);
            self.authorize(AccessKind::Get, read.path.as_str(), current.as_ref(), None, ctx)?;
            tx.record_read(read.path, read.version);
        }

        for op in operations {
            let path = op.path().as_str().to_string();
            let current = self.storage.find(op.path(), tenant);
            let (kind, data) = match &op {
                TxOperation::Create { data, .. } => (AccessKind::Create, Some(data)),
                TxOperation::Update { data, .. } => (AccessKind::Update, Some(data)),
                TxOperation::Delete { .. } => (AccessKind::Delete, None),
            };
            self.authorize(kind, &path, current.as_ref(), data, ctx)?;
            self.storage.add_to_transaction(&mut tx, op)?;
        }

        let receipt = self.storage.commit_transaction(&tx, ctx.actor())?;
        Ok(Outcome::Committed(receipt))
    }

    fn current(&self, path: &str, tenant: &str) -> Result<Option<Document>> {
        let path = DocumentPath::parse(path)?;
        Ok(self.storage.find(&path, tenant))
    }

    fn authorize(
        &self,
        operation: AccessKind,
        path: &str,
        resource: Option<&Document>,
        request_data: Option<&Value>,
        ctx: &RequestContext,
    ) -> Result<()> {
        if let Some(named) = path_tenant(path) {
            if named != ctx.tenant {
                return Err(self.deny(
                    operation,
                    path,
                    format!("path belongs to tenant {} not {}", named, ctx.tenant),
                    ctx,
                ));
            }
        }
        if ctx.bypass_rules() {
            return Ok(());
        }
        if let Some(claimed) = ctx.auth.as_ref().and_then(|auth| auth.tenant_id.as_deref()) {
            if claimed != ctx.tenant {
                return Err(self.deny(
                    operation,
                    path,
                    format!("caller belongs to tenant {} not {}", claimed, ctx.tenant),
                    ctx,
                ));
            }
        }

        let lookup = TenantLookup {
            storage: &self.storage,
            tenant: &ctx.tenant,
        };
        let mut eval = EvaluationContext::new()
            .with_tenant(&ctx.tenant)
            .with_lookup(&lookup);
        if let Some(auth) = &ctx.auth {
            eval = eval.with_auth(auth);
        }
        if let Some(resource) = resource {
            eval = eval.with_resource(resource);
        }
        if let Some(data) = request_data {
            eval = eval.with_request_data(data);
        }

        let decision = self.rules().evaluate(operation, path, &eval);
        if decision.allowed {
            return Ok(());
        }
        Err(self.deny(operation, path, decision.reason, ctx))
    }

    fn deny(
        &self,
        operation: AccessKind,
        path: &str,
        reason: String,
        ctx: &RequestContext,
    ) -> Error {
        warn!(
            event = Event::AccessDenied.as_str(),
            request_id = %ctx.request_id,
            tenant = ctx.tenant.as_str(),
            operation = operation.as_str(),
            path,
            reason = reason.as_str(),
            "request denied"
        );
        Error::AccessDenied {
            operation,
            path: path.to_string(),
            reason,
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Evict expired idempotency records and cached decisions.
    pub fn sweep_expired(&self) -> SweepReport {
        let report = SweepReport {
            idempotency: self.storage.sweep_expired(),
            decisions: self.rules().sweep_expired(),
        };
        debug!(
            event = Event::CacheSwept.as_str(),
            idempotency = report.idempotency,
            decisions = report.decisions,
            "expired cache entries swept"
        );
        report
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every
    /// `maintenance.sweep_interval_secs` on the current tokio runtime.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        self.spawn_maintenance_every(self.config.maintenance.sweep_interval())
    }

    /// Like [`spawn_maintenance`](Self::spawn_maintenance) with an explicit
    /// interval. The task ends once the database is dropped.
    pub fn spawn_maintenance_every(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let db: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match db.upgrade() {
                    Some(db) => {
                        db.sweep_expired();
                    }
                    None => break,
                }
            }
        })
    }
}
