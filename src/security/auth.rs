//! Credential checks for dispatched methods.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Params key that carries the caller's credential.
pub const AUTH_PARAM_KEY: &str = "_auth";

#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Returns true if `credential` may call `method`.
    async fn validate(&self, credential: &Value, method: &str) -> bool;
}

/// Accepts a fixed set of bearer tokens, given either as a plain string or
/// as `{"token": "..."}`.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashSet<String>,
}

impl StaticTokenValidator {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl CredentialValidator for StaticTokenValidator {
    async fn validate(&self, credential: &Value, _method: &str) -> bool {
        let token = match credential {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map.get("token").and_then(Value::as_str),
            _ => None,
        };
        token.is_some_and(|t| self.tokens.contains(t))
    }
}

/// Methods that skip authentication.
const UNAUTHENTICATED_METHODS: &[&str] = &[crate::protocol::types::methods::INITIALIZE];

/// Authentication policy applied by the dispatcher.
#[derive(Clone)]
pub struct AuthPolicy {
    validator: Arc<dyn CredentialValidator>,
}

impl AuthPolicy {
    pub fn new(validator: impl CredentialValidator + 'static) -> Self {
        Self {
            validator: Arc::new(validator),
        }
    }

    pub fn requires_auth(&self, method: &str) -> bool {
        !UNAUTHENTICATED_METHODS.contains(&method)
    }

    pub async fn authorize(&self, credential: Option<&Value>, method: &str) -> bool {
        match credential {
            Some(credential) => self.validator.validate(credential, method).await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_static_tokens() {
        let validator = StaticTokenValidator::new(["secret"]);
        assert!(validator.validate(&json!("secret"), "tools/list").await);
        assert!(validator.validate(&json!({"token": "secret"}), "tools/list").await);
        assert!(!validator.validate(&json!("nope"), "tools/list").await);
        assert!(!validator.validate(&json!(42), "tools/list").await);
    }

    #[tokio::test]
    async fn test_policy() {
        let policy = AuthPolicy::new(StaticTokenValidator::new(["t"]));
        assert!(!policy.requires_auth("initialize"));
        assert!(policy.requires_auth("tools/call"));
        assert!(!policy.authorize(None, "tools/call").await);
        assert!(policy.authorize(Some(&json!("t")), "tools/call").await);
    }
}
