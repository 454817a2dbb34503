//! Rules evaluator
//!
//! Decides allow or deny for one operation on one path. Candidates come from
//! the trie in priority order; the first rule that governs the operation and
//! whose condition holds allows the request. Everything else is denied.
//!
//! Decisions are cached by (operation, path, request tenant, caller
//! fingerprint) when no
//! evaluated condition read the resource, the request payload, or storage.

use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::cache::{CacheStats, TtlCache};
use crate::config::RulesConfig;
use crate::observability::Event;

use super::context::{AccessKind, EvaluationContext};
use super::expr::Scope;
use super::ruleset::RuleSet;

/// Outcome of an evaluation. A deny is a normal result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub matched_rule: Option<String>,
    pub reason: String,
}

impl Decision {
    fn allow(rule: &str) -> Self {
        Self {
            allowed: true,
            matched_rule: Some(rule.to_string()),
            reason: format!("allowed by rule '{}'", rule),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            matched_rule: None,
            reason: reason.into(),
        }
    }
}

type DecisionKey = (AccessKind, String, Option<String>, String);

pub struct RulesEvaluator {
    rules: RuleSet,
    cache: Option<Mutex<TtlCache<DecisionKey, Decision>>>,
}

impl RulesEvaluator {
    pub fn new(rules: RuleSet, config: &RulesConfig) -> Self {
        let cache = config
            .cache_enabled
            .then(|| Mutex::new(TtlCache::new(config.cache_capacity, config.cache_ttl())));
        Self { rules, cache }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn evaluate(
        &self,
        operation: AccessKind,
        path: &str,
        ctx: &EvaluationContext<'_>,
    ) -> Decision {
        let trimmed = path.trim_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();
        if trimmed.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Decision::deny(format!("'{}' is not a valid path", path));
        }

        let key = (
            operation,
            trimmed.to_string(),
            ctx.tenant.map(str::to_string),
            ctx.fingerprint(),
        );
        if let Some(cache) = &self.cache {
            if let Some(decision) = cache.lock().get(&key, Instant::now()) {
                return decision;
            }
        }

        let (decision, cacheable) = self.decide(operation, &segments, ctx);

        if cacheable {
            if let Some(cache) = &self.cache {
                cache.lock().insert(key, decision.clone(), Instant::now());
            }
        }

        if decision.allowed {
            debug!(
                event = Event::AccessAllowed.as_str(),
                operation = operation.as_str(),
                path = trimmed,
                rule = decision.matched_rule.as_deref().unwrap_or_default(),
                "access allowed"
            );
        } else {
            debug!(
                event = Event::AccessDenied.as_str(),
                operation = operation.as_str(),
                path = trimmed,
                reason = decision.reason.as_str(),
                "access denied"
            );
        }
        decision
    }

    fn decide(
        &self,
        operation: AccessKind,
        segments: &[&str],
        ctx: &EvaluationContext<'_>,
    ) -> (Decision, bool) {
        let Some(hit) = self.rules.route(segments) else {
            return (Decision::deny("no rule matches this path"), true);
        };

        let scope = Scope::new(ctx, &hit.bindings);
        let mut governed = false;
        for id in hit.rules {
            let rule = self.rules.rule(*id);
            if !rule.governs(operation) {
                continue;
            }
            governed = true;
            if scope.holds(&rule.condition) {
                return (Decision::allow(&rule.name), scope.is_cacheable());
            }
        }

        let reason = if governed {
            format!("no rule allows {} on this path", operation)
        } else {
            format!("no rule governs {} on this path", operation)
        };
        (Decision::deny(reason), scope.is_cacheable())
    }

    /// Drop expired cached decisions. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        match &self.cache {
            Some(cache) => cache.lock().sweep(Instant::now()),
            None => 0,
        }
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache
            .as_ref()
            .map(|cache| cache.lock().stats())
            .unwrap_or_default()
    }

    pub fn cached_decisions(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::rules::context::{AuthClaims, ResourceLookup};
    use crate::rules::ruleset::RuleDefinition;

    fn evaluator(rules: Vec<RuleDefinition>) -> RulesEvaluator {
        RulesEvaluator::new(RuleSet::compile(rules).unwrap(), &RulesConfig::default())
    }

    #[derive(Default)]
    struct CountingLookup {
        calls: AtomicUsize,
    }

    impl ResourceLookup for CountingLookup {
        fn exists(&self, _path: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_default_deny() {
        let rules = RulesEvaluator::new(RuleSet::empty(), &RulesConfig::default());
        let claims = AuthClaims::new("u1");
        let decision = rules.evaluate(
            AccessKind::Get,
            "tenants/T1/orders/O1",
            &EvaluationContext::new().with_auth(&claims),
        );
        assert!(!decision.allowed);
        assert_eq!(decision.matched_rule, None);
    }

    #[test]
    fn test_tenant_members_allowed() {
        let rules = evaluator(vec![RuleDefinition::new(
            "tenants/{tenantId}/orders/{orderId}",
            &["read"],
            "isSignedIn() && callerTenant() == tenantId",
        )
        .named("members")]);

        let member = AuthClaims::new("u1").with_tenant("T1");
        let outsider = AuthClaims::new("u2").with_tenant("T2");
        let path = "tenants/T1/orders/O1";

        let allowed = rules.evaluate(AccessKind::Get, path, &EvaluationContext::new().with_auth(&member));
        assert!(allowed.allowed);
        assert_eq!(allowed.matched_rule.as_deref(), Some("members"));

        assert!(!rules.evaluate(AccessKind::Get, path, &EvaluationContext::new().with_auth(&outsider)).allowed);
        assert!(!rules.evaluate(AccessKind::Update, path, &EvaluationContext::new().with_auth(&member)).allowed);
        assert!(!rules.evaluate(AccessKind::Get, path, &EvaluationContext::new()).allowed);
    }

    #[test]
    fn test_lower_priority_number_short_circuits() {
        let rules = evaluator(vec![
            RuleDefinition::new("docs/{id}", &["get"], "exists('docs/' + id)").priority(2),
            RuleDefinition::new("docs/{id}", &["get"], "true").named("first").priority(1),
        ]);
        let lookup = CountingLookup::default();
        let ctx = EvaluationContext::new().with_lookup(&lookup);

        let decision = rules.evaluate(AccessKind::Get, "docs/d1", &ctx);
        assert_eq!(decision.matched_rule.as_deref(), Some("first"));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_falls_through_to_next_rule() {
        let rules = evaluator(vec![
            RuleDefinition::new("docs/{id}", &["get"], "hasRole('admin')").named("admins").priority(1),
            RuleDefinition::new("docs/{id}", &["get"], "exists('docs/' + id)").named("existing").priority(2),
        ]);
        let lookup = CountingLookup::default();
        let ctx = EvaluationContext::new().with_lookup(&lookup);

        let decision = rules.evaluate(AccessKind::Get, "docs/d1", &ctx);
        assert_eq!(decision.matched_rule.as_deref(), Some("existing"));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
        // exists() consulted storage, so nothing was cached
        assert_eq!(rules.cached_decisions(), 0);
    }

    #[test]
    fn test_pure_decisions_are_cached() {
        let rules = evaluator(vec![RuleDefinition::new("docs/{id}", &["get"], "hasRole('reader')")]);
        let claims = AuthClaims::new("u1").with_role("reader");
        let ctx = EvaluationContext::new().with_auth(&claims);

        assert!(rules.evaluate(AccessKind::Get, "docs/d1", &ctx).allowed);
        assert!(rules.evaluate(AccessKind::Get, "/docs/d1/", &ctx).allowed);
        assert_eq!(rules.cached_decisions(), 1);
        assert_eq!(rules.cache_stats().hits, 1);

        let other = AuthClaims::new("u1");
        let decision = rules.evaluate(AccessKind::Get, "docs/d1", &EvaluationContext::new().with_auth(&other));
        assert!(!decision.allowed);
        assert_eq!(rules.cached_decisions(), 2);
    }

    #[test]
    fn test_cache_keyed_by_request_tenant() {
        let rules = evaluator(vec![RuleDefinition::new("docs/{id}", &["get"], "request.tenant == 'T1'")]);
        let claims = AuthClaims::new("u1");
        let in_t1 = EvaluationContext::new().with_auth(&claims).with_tenant("T1");
        let in_t2 = EvaluationContext::new().with_auth(&claims).with_tenant("T2");

        assert!(rules.evaluate(AccessKind::Get, "docs/d1", &in_t1).allowed);
        assert!(!rules.evaluate(AccessKind::Get, "docs/d1", &in_t2).allowed);
        assert!(rules.evaluate(AccessKind::Get, "docs/d1", &in_t1).allowed);
        assert_eq!(rules.cached_decisions(), 2);
    }

    #[test]
    fn test_literal_pattern_shadows_variable_pattern() {
        let rules = evaluator(vec![
            RuleDefinition::new("users/me", &["get"], "true").named("me"),
            RuleDefinition::new("users/{uid}", &["update"], "true").named("any-user"),
        ]);
        let ctx = EvaluationContext::new();

        assert!(rules.evaluate(AccessKind::Get, "users/me", &ctx).allowed);
        let decision = rules.evaluate(AccessKind::Update, "users/me", &ctx);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "no rule governs update on this path");
        assert!(rules.evaluate(AccessKind::Update, "users/u1", &ctx).allowed);
    }

    #[test]
    fn test_resource_dependent_decisions_not_cached() {
        let rules = evaluator(vec![RuleDefinition::new(
            "docs/{id}",
            &["update"],
            "resource.data.owner == auth.uid",
        )]);
        let claims = AuthClaims::new("u1");
        let ctx = EvaluationContext::new().with_auth(&claims);
        rules.evaluate(AccessKind::Update, "docs/d1", &ctx);
        assert_eq!(rules.cached_decisions(), 0);
    }

    #[test]
    fn test_cache_can_be_disabled() {
        let rules = RulesEvaluator::new(
            RuleSet::compile(vec![RuleDefinition::new("docs/{id}", &["get"], "true")]).unwrap(),
            &RulesConfig::uncached(),
        );
        rules.evaluate(AccessKind::Get, "docs/d1", &EvaluationContext::new());
        assert_eq!(rules.cached_decisions(), 0);
        assert_eq!(rules.sweep_expired(), 0);
    }

    #[test]
    fn test_invalid_path_denied() {
        let rules = evaluator(vec![RuleDefinition::new("docs/{id}", &["get"], "true")]);
        assert!(!rules.evaluate(AccessKind::Get, "docs//d1", &EvaluationContext::new()).allowed);
        assert!(!rules.evaluate(AccessKind::Get, "", &EvaluationContext::new()).allowed);
    }

    #[test]
    fn test_runtime_type_error_denies() {
        let rules = evaluator(vec![RuleDefinition::new("docs/{id}", &["get"], "size(auth.uid) > 'x'")]);
        let claims = AuthClaims::new("u1");
        assert!(!rules
            .evaluate(AccessKind::Get, "docs/d1", &EvaluationContext::new().with_auth(&claims))
            .allowed);
    }
}
