//! Request handler and method dispatcher.

use crate::error::{ProtocolError, ProtocolResult};
use crate::events::{EventEmitter, ServerEvent};
use crate::hooks::HookPipeline;
use crate::protocol::codec::{params_object, take_param};
use crate::protocol::types::*;
use crate::security::{AUTH_PARAM_KEY, AuthPolicy};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

/// Handler trait for processing MCP requests.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle initialize request.
    async fn initialize(&self, params: InitializeParams) -> ProtocolResult<InitializeResult>;

    /// Handle initialized notification.
    async fn initialized(&self) -> ProtocolResult<()> {
        Ok(())
    }

    /// Handle shutdown request.
    async fn shutdown(&self) -> ProtocolResult<()> {
        Ok(())
    }

    /// List available tools.
    async fn list_tools(&self) -> ProtocolResult<ListToolsResult>;

    /// Call a tool.
    async fn call_tool(&self, params: CallToolParams) -> ProtocolResult<CallToolResult>;

    async fn list_resources(&self) -> ProtocolResult<ListResourcesResult>;

    async fn read_resource(&self, params: ReadResourceParams) -> ProtocolResult<ReadResourceResult>;

    async fn list_prompts(&self) -> ProtocolResult<ListPromptsResult>;

    async fn get_prompt(&self, params: GetPromptParams) -> ProtocolResult<GetPromptResult>;

    /// Handle ping request.
    async fn ping(&self) -> ProtocolResult<Value> {
        Ok(serde_json::json!({}))
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No `initialize` yet, or reset by `shutdown`.
    Uninitialized,
    /// Initialize answered, awaiting the initialized notification.
    Initializing,
    /// Client confirmed it is ready.
    Ready,
}

/// Server-side view of the current session.
#[derive(Debug, Clone)]
pub struct ServerSession {
    pub state: SessionState,
    pub protocol_version: Option<String>,
    pub client_info: Option<ClientInfo>,
}

impl ServerSession {
    fn new() -> Self {
        Self {
            state: SessionState::Uninitialized,
            protocol_version: None,
            client_info: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state != SessionState::Uninitialized
    }
}

/// Methods callable before `initialize` when strict initialization is on.
const PRE_INIT_METHODS: &[&str] = &[methods::INITIALIZE, methods::PING, methods::SHUTDOWN];

/// Method dispatcher that routes requests to appropriate handlers.
pub struct Dispatcher<H: Handler> {
    handler: H,
    session: RwLock<ServerSession>,
    auth: Option<AuthPolicy>,
    hooks: HookPipeline,
    events: EventEmitter,
    strict_initialization: bool,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(handler: H, events: EventEmitter) -> Self {
        Self {
            handler,
            session: RwLock::new(ServerSession::new()),
            auth: None,
            hooks: HookPipeline::new(),
            events,
            strict_initialization: false,
        }
    }

    pub fn with_auth(mut self, auth: AuthPolicy) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_hooks(mut self, hooks: HookPipeline) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_strict_initialization(mut self, strict: bool) -> Self {
        self.strict_initialization = strict;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn session(&self) -> ServerSession {
        self.session.read().clone()
    }

    /// Dispatch a request; always yields exactly one response.
    #[instrument(skip(self, request), fields(method = %request.method, id = %request.id))]
    pub async fn dispatch(&self, mut request: JsonRpcRequest) -> JsonRpcResponse {
        debug!("Dispatching request: {}", request.method);
        self.events.emit(ServerEvent::Request {
            id: request.id.clone(),
            method: request.method.clone(),
        });

        let mut response = match self.authorize(&request.method, &mut request.params).await {
            Err(e) => self.error_response(&request, e),
            Ok(()) => match self.hooks.run_request(&mut request).await {
                Err(response) => response,
                Ok(()) => match self.route(&request).await {
                    Ok(value) => JsonRpcResponse::success(request.id.clone(), value),
                    Err(e) => self.error_response(&request, e),
                },
            },
        };

        self.hooks.run_response(&request, &mut response).await;

        self.events.emit(ServerEvent::Response {
            id: response.id.clone(),
            is_error: response.is_error(),
        });
        response
    }

    /// Handle a notification; never produces a response.
    #[instrument(skip(self, notification), fields(method = %notification.method))]
    pub async fn notify(&self, mut notification: JsonRpcNotification) {
        if let Err(e) = self
            .authorize(&notification.method, &mut notification.params)
            .await
        {
            warn!("Dropping notification {}: {}", notification.method, e);
            return;
        }

        self.events.emit(ServerEvent::Notification {
            method: notification.method.clone(),
        });

        match notification.method.as_str() {
            methods::INITIALIZED | methods::INITIALIZED_LEGACY => {
                if let Err(e) = self.handler.initialized().await {
                    warn!("initialized handler failed: {}", e);
                    return;
                }
                let client_info = {
                    let mut session = self.session.write();
                    session.state = SessionState::Ready;
                    session.client_info.clone()
                };
                info!("Client ready");
                self.events.emit(ServerEvent::ClientConnected { client_info });
            }
            method => debug!("Ignoring notification: {}", method),
        }
    }

    fn error_response(&self, request: &JsonRpcRequest, e: ProtocolError) -> JsonRpcResponse {
        warn!("Request {} failed: {}", request.method, e);
        JsonRpcResponse::error(request.id.clone(), JsonRpcError::from(&e))
    }

    /// Check the credential in `params._auth` and strip it either way.
    async fn authorize(&self, method: &str, params: &mut Option<Value>) -> ProtocolResult<()> {
        let credential = take_param(params, AUTH_PARAM_KEY);

        let Some(auth) = &self.auth else {
            return Ok(());
        };
        if !auth.requires_auth(method) {
            return Ok(());
        }
        if auth.authorize(credential.as_ref(), method).await {
            Ok(())
        } else {
            Err(ProtocolError::Unauthorized(
                format!("valid credential required for {method}").into(),
            ))
        }
    }

    async fn route(&self, request: &JsonRpcRequest) -> ProtocolResult<Value> {
        let params = request.params.clone();
        let method = request.method.as_str();

        if self.strict_initialization
            && !PRE_INIT_METHODS.contains(&method)
            && !self.session.read().is_initialized()
        {
            return Err(ProtocolError::NotInitialized);
        }

        match method {
            methods::INITIALIZE => self.handle_initialize(params).await,
            methods::SHUTDOWN => self.handle_shutdown().await,
            methods::PING => self.handler.ping().await,
            methods::TOOLS_LIST => to_value(self.handler.list_tools().await?),
            methods::TOOLS_CALL => self.handle_call_tool(params).await,
            methods::RESOURCES_LIST => to_value(self.handler.list_resources().await?),
            methods::RESOURCES_READ => {
                let params: ReadResourceParams = parse_params(params, "uri")?;
                to_value(self.handler.read_resource(params).await?)
            }
            methods::PROMPTS_LIST => to_value(self.handler.list_prompts().await?),
            methods::PROMPTS_GET => {
                let params: GetPromptParams = parse_params(params, "name")?;
                to_value(self.handler.get_prompt(params).await?)
            }
            method => Err(ProtocolError::MethodNotFound(method.to_string())),
        }
    }

    async fn handle_initialize(&self, params: Option<Value>) -> ProtocolResult<Value> {
        let params: InitializeParams = params
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ProtocolError::InvalidParams(e.to_string().into()))?
            .ok_or_else(|| ProtocolError::InvalidParams("Missing params".into()))?;

        let client_info = params.client_info.clone();
        let result = self.handler.initialize(params).await?;

        {
            let mut session = self.session.write();
            session.state = SessionState::Initializing;
            session.protocol_version = Some(result.protocol_version.clone());
            session.client_info = Some(client_info);
        }
        info!(
            "Session initialized with protocol {}",
            result.protocol_version
        );
        to_value(result)
    }

    async fn handle_shutdown(&self) -> ProtocolResult<Value> {
        self.handler.shutdown().await?;
        *self.session.write() = ServerSession::new();
        info!("Session shut down");
        self.events.emit(ServerEvent::ClientDisconnected);
        Ok(serde_json::json!({}))
    }

    async fn handle_call_tool(&self, params: Option<Value>) -> ProtocolResult<Value> {
        let params: CallToolParams = parse_params(params, "name")?;
        to_value(self.handler.call_tool(params).await?)
    }
}

/// Deserialize object params, requiring `required` to be present.
fn parse_params<T: DeserializeOwned>(
    params: Option<Value>,
    required: &'static str,
) -> ProtocolResult<T> {
    let object = params_object(params)?;
    if !object.contains_key(required) {
        return Err(ProtocolError::InvalidParams(
            format!("Missing required parameter: {required}").into(),
        ));
    }
    serde_json::from_value(Value::Object(object))
        .map_err(|e| ProtocolError::InvalidParams(e.to_string().into()))
}

fn to_value<T: Serialize>(result: T) -> ProtocolResult<Value> {
    serde_json::to_value(result).map_err(|e| ProtocolError::InternalError(e.to_string().into()))
}
