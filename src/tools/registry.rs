//! Tool registry for dynamic tool registration.

use crate::error::ToolError;
use crate::events::{EventEmitter, ServerEvent};
use crate::protocol::{CallToolParams, CallToolResult, Tool};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};

pub type ToolResult = std::result::Result<CallToolResult, ToolError>;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> ToolResult;
}

/// Adapts an async closure into a [`ToolHandler`].
pub struct FnTool<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnTool<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = ToolResult> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = ToolResult> + Send,
{
    async fn call(&self, arguments: Value) -> ToolResult {
        (self.f)(arguments).await
    }
}

#[derive(Clone)]
struct RegisteredTool {
    descriptor: Tool,
    handler: Arc<dyn ToolHandler>,
}

/// Tools keyed by name. Re-registering a name replaces the old entry.
pub struct ToolRegistry {
    tools: DashMap<String, RegisteredTool>,
    events: EventEmitter,
}

impl ToolRegistry {
    pub fn new(events: EventEmitter) -> Self {
        Self {
            tools: DashMap::new(),
            events,
        }
    }

    pub fn register(&self, descriptor: Tool, handler: Arc<dyn ToolHandler>) {
        let name = descriptor.name.clone();
        debug!("Registering tool: {}", name);
        self.tools.insert(
            name.clone(),
            RegisteredTool {
                descriptor,
                handler,
            },
        );
        self.events.emit(ServerEvent::ToolRegistered { name });
    }

    pub fn register_fn<F, Fut>(&self, descriptor: Tool, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolResult> + Send + 'static,
    {
        self.register(descriptor, Arc::new(FnTool::new(f)));
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.tools.remove(name).is_some();
        if removed {
            debug!("Unregistered tool: {}", name);
            self.events.emit(ServerEvent::ToolUnregistered {
                name: name.to_string(),
            });
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Tool> {
        self.tools.get(name).map(|r| r.descriptor.clone())
    }

    /// Descriptors sorted by name.
    pub fn list(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self.tools.iter().map(|r| r.descriptor.clone()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Run a tool. Unknown tools, handler failures and handler panics come
    /// back as `isError` results rather than protocol errors.
    pub async fn call(&self, params: CallToolParams) -> CallToolResult {
        // Clone out of the map so no shard lock is held across the await.
        let handler = self.tools.get(&params.name).map(|r| Arc::clone(&r.handler));

        let result = match handler {
            Some(handler) => match AssertUnwindSafe(handler.call(params.arguments))
                .catch_unwind()
                .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    error!("Tool '{}' failed: {}", params.name, e);
                    CallToolResult::error(e.to_string())
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!("Tool '{}' panicked: {}", params.name, reason);
                    CallToolResult::error(
                        ToolError::ExecutionFailed(format!("tool panicked: {reason}")).to_string(),
                    )
                }
            },
            None => CallToolResult::error(ToolError::NotFound(params.name.clone()).to_string()),
        };

        self.events.emit(ServerEvent::ToolCalled {
            name: params.name,
            is_error: result.is_error(),
        });
        result
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(EventEmitter::new())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[macro_export]
macro_rules! define_tool {
    (
        name: $name:expr,
        description: $desc:expr,
        schema: $schema:tt
    ) => {
        $crate::protocol::Tool {
            name: $name.into(),
            description: Some($desc.into()),
            input_schema: serde_json::json!($schema),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn descriptor(name: &str) -> Tool {
        define_tool!(
            name: name,
            description: "A test tool",
            schema: { "type": "object", "properties": {} }
        )
    }

    #[test]
    fn test_registry() {
        let registry = ToolRegistry::default();
        registry.register_fn(descriptor("b_tool"), |_| async {
            Ok(CallToolResult::text("b"))
        });
        registry.register_fn(descriptor("a_tool"), |_| async {
            Ok(CallToolResult::text("a"))
        });

        assert_eq!(registry.len(), 2);
        assert!(registry.get("a_tool").is_some());
        assert!(registry.get("unknown").is_none());

        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a_tool", "b_tool"]);
    }

    #[tokio::test]
    async fn test_replace_by_name() {
        let registry = ToolRegistry::default();
        registry.register_fn(descriptor("t"), |_| async { Ok(CallToolResult::text("old")) });
        registry.register_fn(descriptor("t"), |_| async { Ok(CallToolResult::text("new")) });
        assert_eq!(registry.len(), 1);

        let result = registry
            .call(CallToolParams {
                name: "t".into(),
                arguments: Value::Null,
            })
            .await;
        assert_eq!(result.content[0].as_text(), Some("new"));
    }

    #[tokio::test]
    async fn test_failures_become_error_results() {
        let registry = ToolRegistry::default();
        registry.register_fn(descriptor("fails"), |_| async {
            Err(ToolError::ExecutionFailed("kaput".into()))
        });

        let result = registry
            .call(CallToolParams {
                name: "fails".into(),
                arguments: Value::Null,
            })
            .await;
        assert!(result.is_error());

        let missing = registry
            .call(CallToolParams {
                name: "missing".into(),
                arguments: Value::Null,
            })
            .await;
        assert!(missing.is_error());
        assert_eq!(missing.content[0].as_text(), Some("Tool not found: missing"));
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_error_result() {
        let events = EventEmitter::new();
        let (_id, mut rx) = events.channel();
        let registry = ToolRegistry::new(events);
        registry.register_fn(descriptor("explodes"), |_| async {
            panic!("handler blew up");
        });

        let result = registry
            .call(CallToolParams {
                name: "explodes".into(),
                arguments: Value::Null,
            })
            .await;
        assert!(result.is_error());
        assert!(
            result.content[0]
                .as_text()
                .is_some_and(|text| text.contains("handler blew up"))
        );

        let mut called = None;
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::ToolCalled { is_error, .. } = event {
                called = Some(is_error);
            }
        }
        assert_eq!(called, Some(true));
    }

    #[tokio::test]
    async fn test_events() {
        let events = EventEmitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            events.subscribe(move |e: &ServerEvent| seen.lock().push(e.clone()));
        }

        let registry = ToolRegistry::new(events);
        registry.register_fn(descriptor("t"), |_| async { Ok(CallToolResult::text("x")) });
        registry
            .call(CallToolParams {
                name: "t".into(),
                arguments: Value::Null,
            })
            .await;
        assert!(registry.unregister("t"));

        assert_eq!(
            *seen.lock(),
            vec![
                ServerEvent::ToolRegistered { name: "t".into() },
                ServerEvent::ToolCalled {
                    name: "t".into(),
                    is_error: false
                },
                ServerEvent::ToolUnregistered { name: "t".into() },
            ]
        );
    }
}
