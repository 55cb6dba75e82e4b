//! MCP server with lifecycle management.

use crate::config::ServerConfig;
use crate::error::{McpError, Result, TransportResult};
use crate::events::EventEmitter;
use crate::hooks::{Hook, HookPipeline};
use crate::protocol::codec;
use crate::protocol::handler::{Dispatcher, Handler, ServerSession, SessionState};
use crate::protocol::types::*;
use crate::security::{AuthPolicy, StaticTokenValidator};
use crate::server::{McpHandler, ServerState, ServerStateBuilder};
use crate::tools::ToolHandler;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::transport::{MessageHandler, Transport};

/// MCP Server.
pub struct McpServer<H: Handler> {
    info: ServerInfo,
    dispatcher: Dispatcher<H>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
}

impl<H: Handler> McpServer<H> {
    pub fn new(dispatcher: Dispatcher<H>, info: ServerInfo) -> Self {
        Self {
            info,
            dispatcher,
            transport: RwLock::new(None),
        }
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn handler(&self) -> &H {
        self.dispatcher.handler()
    }

    pub fn events(&self) -> &EventEmitter {
        self.dispatcher.events()
    }

    pub fn session(&self) -> ServerSession {
        self.dispatcher.session()
    }

    /// Check if a transport is bound and running.
    pub fn is_running(&self) -> bool {
        self.transport
            .read()
            .as_ref()
            .is_some_and(|t| t.is_running())
    }

    /// Process one inbound message. Never fails: every problem with a
    /// request becomes an error response, notifications yield `None`.
    #[instrument(skip(self, text), fields(server = %self.info.name))]
    pub async fn handle_message(&self, text: &str) -> Option<String> {
        let message = match codec::parse_message(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Rejecting inbound message: {}", e);
                let response = codec::error_response(codec::recover_id(text), &e);
                return Some(codec::serialize_response(&response));
            }
        };

        match message {
            Message::Request(request) => {
                let response = self.dispatcher.dispatch(request).await;
                Some(codec::serialize_response(&response))
            }
            Message::Notification(notification) => {
                self.dispatcher.notify(notification).await;
                None
            }
            Message::Response(response) => {
                warn!("Unexpected response received: {}", response.id);
                None
            }
        }
    }

    /// Push a notification to the client over the bound transport.
    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> TransportResult<()> {
        let transport = self.transport.read().clone();
        let Some(transport) = transport else {
            debug!("No transport bound, dropping notification {}", method);
            return Ok(());
        };
        let message = Message::Notification(codec::create_notification(method, params));
        transport.send(&codec::serialize(&message)).await
    }

    /// Stop the bound transport, if any.
    pub async fn stop(&self) -> Result<()> {
        let transport = self.transport.write().take();
        if let Some(transport) = transport {
            transport.stop().await?;
            info!("Server stopped");
        }
        Ok(())
    }

    async fn notify_list_changed(&self, method: &str) {
        if self.session().state != SessionState::Ready {
            return;
        }
        if let Err(e) = self.notify(method, None).await {
            warn!("Failed to send {}: {}", method, e);
        }
    }
}

impl<H: Handler + 'static> McpServer<H> {
    /// Start `transport` with this server as its message handler.
    pub async fn serve(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<()> {
        info!(
            "Starting MCP server: {} v{}",
            self.info.name, self.info.version
        );
        let handler: Arc<dyn MessageHandler> = Arc::clone(self) as Arc<dyn MessageHandler>;
        transport.start(handler).await?;

        let previous = self.transport.write().replace(transport);
        if let Some(previous) = previous {
            previous.stop().await?;
        }
        Ok(())
    }
}

impl McpServer<McpHandler> {
    pub fn state(&self) -> &Arc<ServerState> {
        self.handler().state()
    }

    /// Register a tool; a ready client is told the list changed.
    pub async fn register_tool(&self, descriptor: Tool, handler: Arc<dyn ToolHandler>) {
        self.state().tools.register(descriptor, handler);
        self.notify_list_changed(methods::TOOLS_LIST_CHANGED).await;
    }

    pub async fn unregister_tool(&self, name: &str) -> bool {
        let removed = self.state().tools.unregister(name);
        if removed {
            self.notify_list_changed(methods::TOOLS_LIST_CHANGED).await;
        }
        removed
    }

    pub async fn register_resource(&self, resource: Resource, text: impl Into<String>) {
        self.state().resources.register_text(resource, text);
        self.notify_list_changed(methods::RESOURCES_LIST_CHANGED).await;
    }

    pub async fn register_prompt(&self, prompt: Prompt, messages: Vec<PromptMessage>) {
        self.state().prompts.register(prompt, messages);
        self.notify_list_changed(methods::PROMPTS_LIST_CHANGED).await;
    }
}

#[async_trait]
impl<H: Handler> MessageHandler for McpServer<H> {
    async fn handle(&self, message: String) -> Option<String> {
        self.handle_message(&message).await
    }
}

/// Builder for an [`McpServer`] backed by [`McpHandler`].
pub struct McpServerBuilder {
    config: ServerConfig,
    events: EventEmitter,
    hooks: HookPipeline,
    builtins: bool,
}

impl McpServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            events: EventEmitter::new(),
            hooks: HookPipeline::new(),
            builtins: false,
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into().into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into().into();
        self
    }

    pub fn events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn hook(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks = self.hooks.with(hook);
        self
    }

    /// Register the built-in tools under the configured prefix.
    pub fn with_builtins(mut self) -> Self {
        self.builtins = true;
        self
    }

    pub fn build(self) -> Result<McpServer<McpHandler>> {
        if self.config.name.is_empty() {
            return Err(McpError::Internal {
                message: "Server name is required".into(),
            });
        }

        let info = ServerInfo {
            name: self.config.name.to_string(),
            version: self.config.version.to_string(),
        };
        let auth_tokens = self.config.auth_tokens.clone();
        let strict = self.config.strict_initialization;

        let mut state = ServerStateBuilder::new()
            .config(self.config)
            .events(self.events.clone());
        if self.builtins {
            state = state.with_builtins();
        }
        let handler = McpHandler::new(Arc::new(state.build()?));

        let mut dispatcher = Dispatcher::new(handler, self.events)
            .with_hooks(self.hooks)
            .with_strict_initialization(strict);
        if !auth_tokens.is_empty() {
            dispatcher = dispatcher.with_auth(AuthPolicy::new(StaticTokenValidator::new(auth_tokens)));
        }

        Ok(McpServer::new(dispatcher, info))
    }
}

impl Default for McpServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ServerEvent;
    use crate::hooks::HookResult;
    use crate::tools::registry::FnTool;
    use crate::tools::ToolResult;
    use serde_json::{Value, json};

    fn server() -> McpServer<McpHandler> {
        McpServerBuilder::new()
            .name("test-server")
            .version("0.1.0")
            .with_builtins()
            .build()
            .unwrap()
    }

    async fn call(server: &McpServer<McpHandler>, text: &str) -> Value {
        let reply = server.handle_message(text).await.unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    const INIT: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"t","version":"1"}}}"#;

    #[test]
    fn test_server_builder() {
        let server = server();
        assert_eq!(server.info().name, "test-server");
        assert_eq!(server.info().version, "0.1.0");
        assert_eq!(server.state().tools.len(), 2);
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_initialize_round_trip() {
        let server = server();
        let reply = call(&server, INIT).await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(reply["result"]["serverInfo"]["name"], "test-server");
        assert_eq!(reply["result"]["capabilities"]["tools"]["listChanged"], true);

        let reply = server
            .handle_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        assert!(reply.is_none());
        assert_eq!(server.session().state, SessionState::Ready);
    }

    #[tokio::test]
    async fn test_parse_error_uses_sentinel_id() {
        let server = server();
        let reply = call(&server, "{oops").await;
        assert_eq!(reply["id"], 0);
        assert_eq!(reply["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_invalid_request_echoes_id() {
        let server = server();
        let reply = call(&server, r#"{"jsonrpc":"1.0","id":"abc","method":"x"}"#).await;
        assert_eq!(reply["id"], "abc");
        assert_eq!(reply["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let server = server();
        let reply = call(&server, r#"{"jsonrpc":"2.0","id":9,"method":"foo/bar"}"#).await;
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_tools_call() {
        let server = server();
        let reply = call(
            &server,
            r#"{"jsonrpc":"2.0","id":"c1","method":"tools/call","params":{"name":"echo","arguments":{"message":"hi"}}}"#,
        )
        .await;
        assert_eq!(reply["id"], "c1");
        assert_eq!(reply["result"]["content"][0]["text"], "hi");

        let reply = call(
            &server,
            r#"{"jsonrpc":"2.0","id":"c2","method":"tools/call","params":{"arguments":{}}}"#,
        )
        .await;
        assert_eq!(reply["error"]["code"], -32602);
        assert_eq!(server.state().tool_call_count(), 1);

        let reply = call(
            &server,
            r#"{"jsonrpc":"2.0","id":"c3","method":"tools/call","params":{"name":"nope"}}"#,
        )
        .await;
        assert_eq!(reply["result"]["isError"], true);
    }

    #[tokio::test]
    async fn test_panicking_tool_does_not_take_server_down() {
        let server = server();
        let tool = crate::define_tool!(name: "fragile", description: "panics on demand", schema: {"type": "object"});
        let fragile = |args: Value| async move {
            if args["explode"] == true {
                panic!("tool exploded");
            }
            ToolResult::Ok(crate::protocol::CallToolResult::text("calm"))
        };
        server
            .register_tool(tool, Arc::new(FnTool::new(fragile)))
            .await;

        let reply = call(
            &server,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"fragile","arguments":{"explode":true}}}"#,
        )
        .await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"]["isError"], true);

        let reply = call(
            &server,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"fragile","arguments":{}}}"#,
        )
        .await;
        assert_eq!(reply["result"]["content"][0]["text"], "calm");
    }

    #[tokio::test]
    async fn test_notification_never_answered() {
        let server = server();
        assert!(
            server
                .handle_message(r#"{"jsonrpc":"2.0","method":"tools/list"}"#)
                .await
                .is_none()
        );
        assert!(
            server
                .handle_message(r#"{"jsonrpc":"2.0","method":"something/else","params":{}}"#)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_auth_tokens_from_config() {
        let config = ServerConfig::builder().auth_token("s3cret").build().unwrap();
        let server = McpServerBuilder::new().config(config).build().unwrap();

        let reply = call(&server, r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).await;
        assert_eq!(reply["error"]["code"], -32000);

        let reply = call(
            &server,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list","params":{"_auth":"s3cret"}}"#,
        )
        .await;
        assert!(reply["result"]["tools"].is_array());
    }

    struct Tag;

    #[async_trait]
    impl Hook for Tag {
        fn name(&self) -> &str {
            "tag"
        }

        async fn on_response(
            &self,
            _request: &JsonRpcRequest,
            response: &mut JsonRpcResponse,
        ) -> HookResult {
            if let Some(Value::Object(result)) = response.result.as_mut() {
                result.insert("tagged".into(), json!(true));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_response_hook_applied() {
        let server = McpServerBuilder::new().hook(Tag).build().unwrap();
        let reply = call(&server, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await;
        assert_eq!(reply["result"]["tagged"], true);
    }

    #[derive(Default)]
    struct Recorder {
        sent: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn start(&self, _handler: Arc<dyn MessageHandler>) -> TransportResult<()> {
            Ok(())
        }

        async fn stop(&self) -> TransportResult<()> {
            Ok(())
        }

        async fn send(&self, message: &str) -> TransportResult<()> {
            self.sent.lock().push(message.to_string());
            Ok(())
        }

        fn is_running(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_list_changed_only_when_ready() {
        let server = Arc::new(server());
        let recorder = Arc::new(Recorder::default());
        server.serve(recorder.clone()).await.unwrap();
        assert!(server.is_running());

        let (_, mut events) = server.events().channel();

        let tool = crate::define_tool!(name: "late", description: "added later", schema: {"type": "object"});
        let noop = |_args: Value| async { ToolResult::Ok(crate::protocol::CallToolResult::text("ok")) };
        server
            .register_tool(tool.clone(), Arc::new(FnTool::new(noop)))
            .await;
        assert!(recorder.sent.lock().is_empty());

        call(&server, INIT).await;
        server
            .handle_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        server
            .register_tool(tool, Arc::new(FnTool::new(noop)))
            .await;

        let sent = recorder.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("notifications/tools/list_changed"));

        assert_eq!(
            events.recv().await,
            Some(ServerEvent::ToolRegistered {
                name: "late".into()
            })
        );
    }
}
