//! Request/response hooks.
//!
//! A hook is an opaque transform applied around dispatch. Each call reports
//! `success` (`Ok(())`) or `error` (`Err(HookError)`); the concrete hook
//! catalogue lives outside this crate.

use crate::error::codes;
use crate::protocol::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure reported by a hook.
#[derive(Debug, Clone, Error)]
#[error("hook '{hook}' failed: {message}")]
pub struct HookError {
    pub hook: String,
    pub message: String,
    /// JSON-RPC code for the resulting error response; internal error if unset.
    pub code: Option<i32>,
}

impl HookError {
    pub fn new(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            hook: hook.into(),
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    fn to_rpc_error(&self) -> JsonRpcError {
        JsonRpcError::new(self.code.unwrap_or(codes::INTERNAL_ERROR), self.message.clone())
            .with_data(serde_json::json!({ "hook": self.hook }))
    }
}

pub type HookResult = std::result::Result<(), HookError>;

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_request(&self, _request: &mut JsonRpcRequest) -> HookResult {
        Ok(())
    }

    async fn on_response(
        &self,
        _request: &JsonRpcRequest,
        _response: &mut JsonRpcResponse,
    ) -> HookResult {
        Ok(())
    }
}

/// Hooks applied in registration order.
#[derive(Clone, Default)]
pub struct HookPipeline {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Arc<dyn Hook>) {
        debug!("Registering hook: {}", hook.name());
        self.hooks.push(hook);
    }

    pub fn with(mut self, hook: impl Hook + 'static) -> Self {
        self.push(Arc::new(hook));
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run request hooks; the first failure short-circuits into an error response.
    pub async fn run_request(
        &self,
        request: &mut JsonRpcRequest,
    ) -> std::result::Result<(), JsonRpcResponse> {
        for hook in &self.hooks {
            if let Err(e) = hook.on_request(request).await {
                warn!("{}", e);
                return Err(JsonRpcResponse::error(request.id.clone(), e.to_rpc_error()));
            }
        }
        Ok(())
    }

    /// Run response hooks; a failure replaces the response with the hook's error.
    pub async fn run_response(&self, request: &JsonRpcRequest, response: &mut JsonRpcResponse) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_response(request, response).await {
                warn!("{}", e);
                *response = JsonRpcResponse::error(request.id.clone(), e.to_rpc_error());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Tag;

    #[async_trait]
    impl Hook for Tag {
        fn name(&self) -> &str {
            "tag"
        }

        async fn on_request(&self, request: &mut JsonRpcRequest) -> HookResult {
            request.params = Some(json!({ "tagged": true }));
            Ok(())
        }
    }

    struct Deny;

    #[async_trait]
    impl Hook for Deny {
        fn name(&self) -> &str {
            "deny"
        }

        async fn on_request(&self, _request: &mut JsonRpcRequest) -> HookResult {
            Err(HookError::new("deny", "blocked").with_code(-32001))
        }
    }

    #[tokio::test]
    async fn test_request_transform() {
        let pipeline = HookPipeline::new().with(Tag);
        let mut request = JsonRpcRequest::new(1, "tools/list");
        pipeline.run_request(&mut request).await.unwrap();
        assert_eq!(request.params, Some(json!({ "tagged": true })));
    }

    #[tokio::test]
    async fn test_request_hook_error_short_circuits() {
        let pipeline = HookPipeline::new().with(Deny).with(Tag);
        let mut request = JsonRpcRequest::new(9, "tools/list");
        let response = pipeline.run_request(&mut request).await.unwrap_err();

        let error = response.error.unwrap();
        assert_eq!(error.code, -32001);
        assert_eq!(response.id, 9.into());
        assert!(request.params.is_none());
    }
}
