//! Request Context
//!
//! Who is calling, for which tenant. Carried through every gateway call.

use std::time::Instant;

use uuid::Uuid;

use crate::rules::AuthClaims;

/// Context for one gateway request
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request ID for tracing
    pub request_id: Uuid,

    /// Tenant whose partition the request reads and writes
    pub tenant: String,

    /// Verified claims, `None` for anonymous callers
    pub auth: Option<AuthClaims>,

    /// Administrative tooling; skips rule evaluation
    service: bool,

    started_at: Instant,
}

impl RequestContext {
    /// Context for a signed-in caller
    pub fn new(tenant: impl Into<String>, auth: AuthClaims) -> Self {
        Self::build(tenant.into(), Some(auth), false)
    }

    /// Context for an unauthenticated caller
    pub fn anonymous(tenant: impl Into<String>) -> Self {
        Self::build(tenant.into(), None, false)
    }

    /// Create a service context (bypasses rules)
    pub fn service(tenant: impl Into<String>) -> Self {
        Self::build(tenant.into(), None, true)
    }

    fn build(tenant: String, auth: Option<AuthClaims>, service: bool) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            tenant,
            auth,
            service,
            started_at: Instant::now(),
        }
    }

    /// Check if rules should be bypassed
    pub fn bypass_rules(&self) -> bool {
        self.service
    }

    /// Name recorded as the actor in the change log
    pub fn actor(&self) -> &str {
        match (&self.auth, self.service) {
            (Some(auth), _) => &auth.uid,
            (None, true) => "service",
            (None, false) => "anonymous",
        }
    }

    /// Get elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }
}
