//! Built-in condition functions
//!
//! Names and arities are fixed, so every call is checked when the rule set
//! is loaded.

use serde_json::Value;

use super::context::EvaluationContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// `isSignedIn()`
    IsSignedIn,
    /// `hasRole(role)`
    HasRole,
    /// `hasAnyRole([roles])`
    HasAnyRole,
    /// `callerTenant()`, null when anonymous or unscoped
    CallerTenant,
    /// `exists(path)`, consults storage so results are never cached
    Exists,
    /// `size(value)`, length of a list, map or string
    Size,
}

impl Builtin {
    pub fn resolve(name: &str) -> Option<Builtin> {
        match name {
            "isSignedIn" => Some(Builtin::IsSignedIn),
            "hasRole" => Some(Builtin::HasRole),
            "hasAnyRole" => Some(Builtin::HasAnyRole),
            "callerTenant" => Some(Builtin::CallerTenant),
            "exists" => Some(Builtin::Exists),
            "size" => Some(Builtin::Size),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::IsSignedIn => "isSignedIn",
            Builtin::HasRole => "hasRole",
            Builtin::HasAnyRole => "hasAnyRole",
            Builtin::CallerTenant => "callerTenant",
            Builtin::Exists => "exists",
            Builtin::Size => "size",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Builtin::IsSignedIn | Builtin::CallerTenant => 0,
            Builtin::HasRole | Builtin::HasAnyRole | Builtin::Exists | Builtin::Size => 1,
        }
    }

    /// Whether the result may depend on state outside the cache key.
    pub fn reads_storage(&self) -> bool {
        matches!(self, Builtin::Exists)
    }

    /// Apply to already-evaluated arguments. `None` means the call is
    /// ill-typed and the enclosing condition fails.
    pub fn call(&self, args: &[Value], ctx: &EvaluationContext<'_>) -> Option<Value> {
        match (self, args) {
            (Builtin::IsSignedIn, []) => Some(Value::Bool(ctx.auth.is_some())),
            (Builtin::HasRole, [Value::String(role)]) => {
                Some(Value::Bool(ctx.auth.map_or(false, |auth| auth.has_role(role))))
            }
            (Builtin::HasAnyRole, [Value::Array(roles)]) => {
                let auth = ctx.auth;
                Some(Value::Bool(roles.iter().any(|role| match (role, auth) {
                    (Value::String(role), Some(auth)) => auth.has_role(role),
                    _ => false,
                })))
            }
            (Builtin::CallerTenant, []) => Some(
                ctx.auth
                    .and_then(|auth| auth.tenant_id.clone())
                    .map_or(Value::Null, Value::String),
            ),
            (Builtin::Exists, [Value::String(path)]) => Some(Value::Bool(
                ctx.lookup.map_or(false, |lookup| lookup.exists(path)),
            )),
            (Builtin::Size, [value]) => {
                let len = match value {
                    Value::Array(items) => items.len(),
                    Value::Object(fields) => fields.len(),
                    Value::String(s) => s.chars().count(),
                    _ => return None,
                };
                Some(Value::from(len))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::context::{AuthClaims, ResourceLookup};
    use serde_json::json;

    struct OnlyOrders;

    impl ResourceLookup for OnlyOrders {
        fn exists(&self, path: &str) -> bool {
            path.starts_with("orders/")
        }
    }

    #[test]
    fn test_role_functions() {
        let claims = AuthClaims::new("u").with_role("editor");
        let ctx = EvaluationContext::new().with_auth(&claims);

        assert_eq!(Builtin::HasRole.call(&[json!("editor")], &ctx), Some(json!(true)));
        assert_eq!(Builtin::HasRole.call(&[json!("admin")], &ctx), Some(json!(false)));
        assert_eq!(
            Builtin::HasAnyRole.call(&[json!(["admin", "editor"])], &ctx),
            Some(json!(true))
        );
        assert_eq!(Builtin::HasRole.call(&[json!(1)], &ctx), None);
    }

    #[test]
    fn test_anonymous_caller() {
        let ctx = EvaluationContext::new();
        assert_eq!(Builtin::IsSignedIn.call(&[], &ctx), Some(json!(false)));
        assert_eq!(Builtin::CallerTenant.call(&[], &ctx), Some(Value::Null));
        assert_eq!(Builtin::HasRole.call(&[json!("admin")], &ctx), Some(json!(false)));
    }

    #[test]
    fn test_exists_uses_lookup() {
        let lookup = OnlyOrders;
        let ctx = EvaluationContext::new().with_lookup(&lookup);
        assert_eq!(Builtin::Exists.call(&[json!("orders/a")], &ctx), Some(json!(true)));
        assert_eq!(Builtin::Exists.call(&[json!("users/a")], &ctx), Some(json!(false)));
        assert!(Builtin::Exists.reads_storage());
    }

    #[test]
    fn test_size() {
        let ctx = EvaluationContext::new();
        assert_eq!(Builtin::Size.call(&[json!([1, 2, 3])], &ctx), Some(json!(3)));
        assert_eq!(Builtin::Size.call(&[json!("héllo")], &ctx), Some(json!(5)));
        assert_eq!(Builtin::Size.call(&[json!({"a": 1})], &ctx), Some(json!(1)));
        assert_eq!(Builtin::Size.call(&[json!(7)], &ctx), None);
    }

    #[test]
    fn test_resolve_round_trips_names() {
        for name in ["isSignedIn", "hasRole", "hasAnyRole", "callerTenant", "exists", "size"] {
            assert_eq!(Builtin::resolve(name).unwrap().name(), name);
        }
        assert!(Builtin::resolve("eval").is_none());
    }
}
