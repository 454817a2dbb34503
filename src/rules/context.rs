//! Evaluation context
//!
//! Everything a condition may read: the caller's claims, the existing
//! resource, the incoming request payload, and an existence probe.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::storage::Document;

use super::errors::RulesError;

/// The operation being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Get,
    List,
    Create,
    Update,
    Delete,
}

impl AccessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessKind::Get => "get",
            AccessKind::List => "list",
            AccessKind::Create => "create",
            AccessKind::Update => "update",
            AccessKind::Delete => "delete",
        }
    }

    /// Expand a declared operation name. `read` covers get and list,
    /// `write` covers create, update and delete.
    pub fn expand(name: &str) -> Option<&'static [AccessKind]> {
        match name {
            "get" => Some(&[AccessKind::Get]),
            "list" => Some(&[AccessKind::List]),
            "create" => Some(&[AccessKind::Create]),
            "update" => Some(&[AccessKind::Update]),
            "delete" => Some(&[AccessKind::Delete]),
            "read" => Some(&[AccessKind::Get, AccessKind::List]),
            "write" => Some(&[AccessKind::Create, AccessKind::Update, AccessKind::Delete]),
            _ => None,
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessKind {
    type Err = RulesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match AccessKind::expand(s) {
            Some([single]) => Ok(*single),
            _ => Err(RulesError::InvalidRuleSet(format!(
                "'{}' is not a single operation",
                s
            ))),
        }
    }
}

/// Claims about the authenticated caller, as issued by the identity service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthClaims {
    pub uid: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Any further token claims, readable as `auth.token.<name>`
    #[serde(default)]
    pub token: BTreeMap<String, Value>,
}

impl AuthClaims {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..Self::default()
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_token_claim(mut self, name: impl Into<String>, value: Value) -> Self {
        self.token.insert(name.into(), value);
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// The claims as the `auth` object seen by conditions.
    pub(crate) fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Stable digest of every claim, used to key cached decisions.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_value().to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Existence probe for the `exists()` built-in.
pub trait ResourceLookup: Send + Sync {
    /// Whether a document exists at `path` in the caller's tenant.
    fn exists(&self, path: &str) -> bool;
}

/// Inputs to one evaluation
#[derive(Default, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub auth: Option<&'a AuthClaims>,
    /// The document currently stored at the target path
    pub resource: Option<&'a Document>,
    /// Payload carried by a create or update
    pub request_data: Option<&'a Value>,
    /// Partition the request runs against, seen as `request.tenant`
    pub tenant: Option<&'a str>,
    pub lookup: Option<&'a dyn ResourceLookup>,
}

impl<'a> EvaluationContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auth(mut self, auth: &'a AuthClaims) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_resource(mut self, resource: &'a Document) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_request_data(mut self, data: &'a Value) -> Self {
        self.request_data = Some(data);
        self
    }

    pub fn with_tenant(mut self, tenant: &'a str) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn with_lookup(mut self, lookup: &'a dyn ResourceLookup) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub(crate) fn fingerprint(&self) -> String {
        match self.auth {
            Some(auth) => auth.fingerprint(),
            None => "anonymous".to_string(),
        }
    }
}

impl fmt::Debug for EvaluationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationContext")
            .field("auth", &self.auth)
            .field("resource", &self.resource.map(|doc| doc.path.as_str()))
            .field("request_data", &self.request_data.is_some())
            .field("tenant", &self.tenant)
            .field("lookup", &self.lookup.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_aliases_expand() {
        assert_eq!(AccessKind::expand("read").unwrap(), &[AccessKind::Get, AccessKind::List]);
        assert_eq!(AccessKind::expand("write").unwrap().len(), 3);
        assert!(AccessKind::expand("admin").is_none());
        assert_eq!("update".parse::<AccessKind>().unwrap(), AccessKind::Update);
        assert!("read".parse::<AccessKind>().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_every_claim() {
        let base = AuthClaims::new("u1").with_tenant("T1");
        let same = AuthClaims::new("u1").with_tenant("T1");
        let admin = base.clone().with_role("admin");
        let token = base.clone().with_token_claim("plan", json!("pro"));

        assert_eq!(base.fingerprint(), same.fingerprint());
        assert_ne!(base.fingerprint(), admin.fingerprint());
        assert_ne!(base.fingerprint(), token.fingerprint());
        assert_eq!(base.fingerprint().len(), 64);
    }

    #[test]
    fn test_auth_value_shape() {
        let claims = AuthClaims::new("u1")
            .with_tenant("T1")
            .with_role("editor")
            .with_email("u1@example.com");
        let value = claims.to_value();
        assert_eq!(value["uid"], json!("u1"));
        assert_eq!(value["tenantId"], json!("T1"));
        assert_eq!(value["roles"], json!(["editor"]));
    }

    #[test]
    fn test_anonymous_fingerprint() {
        assert_eq!(EvaluationContext::new().fingerprint(), "anonymous");
    }
}
