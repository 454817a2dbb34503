//! Rules Evaluation Tests
//!
//! Tests for rules invariants:
//! - No matching rule means deny
//! - Lower priority numbers are evaluated first and short-circuit
//! - Malformed rule sets fail at load, never per request
//! - Path variables bind from the request path

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use tenantdb::config::RulesConfig;
use tenantdb::rules::{
    AccessKind, AuthClaims, EvaluationContext, ResourceLookup, RuleDefinition, RuleSet,
    RulesError, RulesEvaluator,
};
use tenantdb::storage::{StorageEngine, WriteOptions};

// =============================================================================
// Helper Functions
// =============================================================================

const RULES: &str = r#"
[[rules]]
name = "tenant-members-read"
path = "tenants/{tenantId}/orders/{orderId}"
operations = ["read"]
condition = "isSignedIn() && callerTenant() == tenantId"
priority = 10

[[rules]]
name = "tenant-admins-write"
path = "tenants/{tenantId}/orders/{orderId}"
operations = ["write"]
condition = "callerTenant() == tenantId && hasAnyRole(['admin', 'owner'])"
priority = 10

[[rules]]
name = "authors-update-open"
path = "tenants/{tenantId}/orders/{orderId}"
operations = ["update"]
condition = "resource.data.author == auth.uid && resource.data.status == 'open' && request.data.status in ['open', 'closed']"
priority = 20

[[rules]]
name = "own-profile"
path = "users/{uid}"
operations = ["get", "update"]
condition = "auth.uid == uid"
"#;

fn evaluator() -> RulesEvaluator {
    RulesEvaluator::new(RuleSet::from_toml(RULES).unwrap(), &RulesConfig::default())
}

#[derive(Default)]
struct CountingLookup {
    calls: AtomicUsize,
}

impl ResourceLookup for CountingLookup {
    fn exists(&self, _path: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        false
    }
}

// =============================================================================
// Default Deny
// =============================================================================

/// Zero registered rules deny every operation.
#[test]
fn test_empty_rule_set_denies_everything() {
    let rules = RulesEvaluator::new(RuleSet::empty(), &RulesConfig::default());
    let claims = AuthClaims::new("root").with_role("admin").with_tenant("T1");
    let ctx = EvaluationContext::new().with_auth(&claims);

    for op in [
        AccessKind::Get,
        AccessKind::List,
        AccessKind::Create,
        AccessKind::Update,
        AccessKind::Delete,
    ] {
        assert!(!rules.evaluate(op, "tenants/T1/orders/O1", &ctx).allowed);
    }
}

/// A path no rule covers is denied.
#[test]
fn test_unmatched_path_denied() {
    let rules = evaluator();
    let claims = AuthClaims::new("u1").with_tenant("T1");
    let decision = rules.evaluate(
        AccessKind::Get,
        "tenants/T1/invoices/I1",
        &EvaluationContext::new().with_auth(&claims),
    );
    assert!(!decision.allowed);
    assert!(decision.matched_rule.is_none());
}

// =============================================================================
// Tenant Scoping
// =============================================================================

/// Members read their own tenant only.
#[test]
fn test_members_read_own_tenant() {
    let rules = evaluator();
    let claims = AuthClaims::new("u1").with_tenant("T1");
    let ctx = EvaluationContext::new().with_auth(&claims);

    let decision = rules.evaluate(AccessKind::Get, "tenants/T1/orders/O1", &ctx);
    assert!(decision.allowed);
    assert_eq!(decision.matched_rule.as_deref(), Some("tenant-members-read"));
    assert!(rules.evaluate(AccessKind::List, "tenants/T1/orders/O1", &ctx).allowed);
    assert!(!rules.evaluate(AccessKind::Get, "tenants/T2/orders/O1", &ctx).allowed);
}

/// Writes need a privileged role in the caller's own tenant.
#[test]
fn test_admin_writes() {
    let rules = evaluator();
    let admin = AuthClaims::new("a1").with_tenant("T1").with_role("admin");
    let member = AuthClaims::new("m1").with_tenant("T1");

    let path = "tenants/T1/orders/O1";
    assert!(rules
        .evaluate(AccessKind::Delete, path, &EvaluationContext::new().with_auth(&admin))
        .allowed);
    assert!(!rules
        .evaluate(AccessKind::Delete, path, &EvaluationContext::new().with_auth(&member))
        .allowed);
}

// =============================================================================
// Resource and Request Data
// =============================================================================

/// Conditions read the stored document and the incoming payload.
#[test]
fn test_author_updates_open_order() {
    let rules = evaluator();
    let storage = StorageEngine::new(Default::default());
    let doc = storage
        .create(
            "tenants/T1/orders/O1",
            json!({"author": "u1", "status": "open"}),
            "T1",
            "u1",
            WriteOptions::default(),
        )
        .unwrap();
    let claims = AuthClaims::new("u1").with_tenant("T1");

    let closing = json!({"status": "closed"});
    let ctx = EvaluationContext::new()
        .with_auth(&claims)
        .with_resource(&doc)
        .with_request_data(&closing);
    let decision = rules.evaluate(AccessKind::Update, "tenants/T1/orders/O1", &ctx);
    assert_eq!(decision.matched_rule.as_deref(), Some("authors-update-open"));

    let bogus = json!({"status": "shipped"});
    let ctx = EvaluationContext::new()
        .with_auth(&claims)
        .with_resource(&doc)
        .with_request_data(&bogus);
    assert!(!rules.evaluate(AccessKind::Update, "tenants/T1/orders/O1", &ctx).allowed);
}

/// Without a stored document, resource fields resolve to null and deny.
#[test]
fn test_missing_resource_denies() {
    let rules = evaluator();
    let claims = AuthClaims::new("u1").with_tenant("T1");
    let payload = json!({"status": "open"});
    let ctx = EvaluationContext::new().with_auth(&claims).with_request_data(&payload);
    assert!(!rules.evaluate(AccessKind::Update, "tenants/T1/orders/O1", &ctx).allowed);
}

/// Bare path variables bind from the request path.
#[test]
fn test_own_profile() {
    let rules = evaluator();
    let claims = AuthClaims::new("u7");
    let ctx = EvaluationContext::new().with_auth(&claims);
    assert!(rules.evaluate(AccessKind::Get, "users/u7", &ctx).allowed);
    assert!(!rules.evaluate(AccessKind::Get, "users/u8", &ctx).allowed);
    assert!(!rules.evaluate(AccessKind::Delete, "users/u7", &ctx).allowed);
}

// =============================================================================
// Priority
// =============================================================================

/// A passing lower-number rule means the higher-number rule never runs.
#[test]
fn test_priority_short_circuit() {
    let rules = RulesEvaluator::new(
        RuleSet::compile(vec![
            RuleDefinition::new("docs/{id}", &["get"], "exists('audit/' + id)")
                .named("slow")
                .priority(5),
            RuleDefinition::new("docs/{id}", &["get"], "isSignedIn()")
                .named("fast")
                .priority(0),
        ])
        .unwrap(),
        &RulesConfig::uncached(),
    );

    let lookup = CountingLookup::default();
    let claims = AuthClaims::new("u1");
    let signed_in = EvaluationContext::new().with_auth(&claims).with_lookup(&lookup);
    let decision = rules.evaluate(AccessKind::Get, "docs/d1", &signed_in);
    assert_eq!(decision.matched_rule.as_deref(), Some("fast"));
    assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);

    // anonymous callers fall through to the slower rule
    let anonymous = EvaluationContext::new().with_lookup(&lookup);
    assert!(!rules.evaluate(AccessKind::Get, "docs/d1", &anonymous).allowed);
    assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Load-Time Errors
// =============================================================================

/// Unknown functions are rejected when the rule set loads.
#[test]
fn test_unknown_function_is_load_error() {
    let err = RuleSet::compile(vec![RuleDefinition::new("docs/{id}", &["get"], "isAdmin()")])
        .unwrap_err();
    assert!(matches!(err, RulesError::UnknownFunction { .. }));
}

/// Wrong argument counts are rejected when the rule set loads.
#[test]
fn test_arity_is_load_error() {
    let err = RuleSet::compile(vec![RuleDefinition::new("docs/{id}", &["get"], "hasRole()")])
        .unwrap_err();
    assert!(matches!(err, RulesError::ArityMismatch { .. }));
}

/// Malformed path patterns are rejected when the rule set loads.
#[test]
fn test_bad_pattern_is_load_error() {
    let err = RuleSet::compile(vec![RuleDefinition::new("docs/{id", &["get"], "true")])
        .unwrap_err();
    assert!(matches!(err, RulesError::InvalidPathPattern { .. }));
}

/// Two variable names at one depth cannot share the trie.
#[test]
fn test_conflicting_variables_is_load_error() {
    let err = RuleSet::compile(vec![
        RuleDefinition::new("tenants/{tenantId}/orders/{id}", &["get"], "true"),
        RuleDefinition::new("tenants/{tid}/users/{id}", &["get"], "true"),
    ])
    .unwrap_err();
    assert!(matches!(err, RulesError::ConflictingVariable { .. }));
}

/// Condition syntax errors report their position.
#[test]
fn test_syntax_error_position() {
    let err = RuleSet::compile(vec![RuleDefinition::new("docs/{id}", &["get"], "auth.uid ==")])
        .unwrap_err();
    assert!(matches!(err, RulesError::ConditionSyntax { .. }));
}
