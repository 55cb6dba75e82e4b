//! Outbound MCP client.
//!
//! A client owns one transport to one server. `connect` performs the
//! `initialize` handshake; afterwards requests are plain round trips with a
//! per-request timeout. A transport failure or timeout moves the client to
//! [`ClientState::Error`], which the pool treats as "evict on release".

pub mod connector;
pub mod transport;

pub use connector::{Connector, DefaultConnector, Endpoint, InProcessConnector};
pub use transport::{
    ClientTransport, HttpClientTransport, InProcessClientTransport, ProcessClientTransport,
};

use crate::config::ConnectOptions;
use crate::error::{ClientError, ClientResult};
use crate::protocol::codec;
use crate::protocol::types::*;
use crate::security::AUTH_PARAM_KEY;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Ready,
    Error,
}

pub struct McpClient {
    connector: Arc<dyn Connector>,
    state: RwLock<ClientState>,
    transport: RwLock<Option<Arc<dyn ClientTransport>>>,
    server_info: RwLock<Option<ServerInfo>>,
    tools: RwLock<Vec<Tool>>,
    options: RwLock<ConnectOptions>,
    next_id: AtomicI64,
}

impl McpClient {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            state: RwLock::new(ClientState::Disconnected),
            transport: RwLock::new(None),
            server_info: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            options: RwLock::new(ConnectOptions::default()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClientState::Ready
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().clone()
    }

    /// Tools from the last successful `list_tools`; empty before that.
    pub fn cached_tools(&self) -> Vec<Tool> {
        self.tools.read().clone()
    }

    /// Open a transport for `uri` and run the initialize handshake.
    #[instrument(skip(self, options))]
    pub async fn connect(&self, uri: &str, options: ConnectOptions) -> ClientResult<ServerInfo> {
        let previous = self.transport.write().take();
        if let Some(previous) = previous {
            debug!("Replacing existing connection");
            close_quietly(previous.as_ref()).await;
        }

        *self.state.write() = ClientState::Connecting;
        *self.options.write() = options.clone();

        let transport = match self.connector.open(uri).await {
            Ok(transport) => transport,
            Err(e) => {
                *self.state.write() = ClientState::Error;
                return Err(e);
            }
        };

        match self.initialize(transport.as_ref(), &options).await {
            Ok(info) => {
                info!("Connected to {} v{}", info.name, info.version);
                *self.transport.write() = Some(transport);
                *self.server_info.write() = Some(info.clone());
                *self.state.write() = ClientState::Ready;
                Ok(info)
            }
            Err(e) => {
                warn!("Handshake with {} failed: {}", uri, e);
                close_quietly(transport.as_ref()).await;
                *self.state.write() = ClientState::Error;
                Err(e)
            }
        }
    }

    async fn initialize(
        &self,
        transport: &dyn ClientTransport,
        options: &ConnectOptions,
    ) -> ClientResult<ServerInfo> {
        let params = InitializeParams {
            protocol_version: options.protocol_version.clone(),
            capabilities: ClientCapabilities::default(),
            client_info: options.client_info.clone(),
        };
        let params =
            serde_json::to_value(params).map_err(|e| ClientError::Handshake(e.to_string()))?;

        let result = self
            .round_trip(transport, methods::INITIALIZE, Some(params))
            .await?;
        let result: InitializeResult =
            serde_json::from_value(result).map_err(|e| ClientError::Handshake(e.to_string()))?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(ClientError::Handshake(format!(
                "unsupported protocol version {}",
                result.protocol_version
            )));
        }

        let params = attach_credential(None, options.credential.as_ref());
        transport
            .notify(codec::create_notification(methods::INITIALIZED, params))
            .await?;
        Ok(result.server_info)
    }

    /// Close the transport. Safe to call repeatedly or after a failure.
    pub async fn disconnect(&self) {
        let transport = self.transport.write().take();
        *self.state.write() = ClientState::Disconnected;
        *self.server_info.write() = None;

        if let Some(transport) = transport {
            close_quietly(transport.as_ref()).await;
            debug!("Disconnected");
        }
    }

    pub async fn list_tools(&self) -> ClientResult<Vec<Tool>> {
        let result: ListToolsResult = self.request(methods::TOOLS_LIST, None).await?;
        *self.tools.write() = result.tools.clone();
        Ok(result.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> ClientResult<CallToolResult> {
        self.request(
            methods::TOOLS_CALL,
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    pub async fn list_resources(&self) -> ClientResult<Vec<Resource>> {
        let result: ListResourcesResult = self.request(methods::RESOURCES_LIST, None).await?;
        Ok(result.resources)
    }

    pub async fn read_resource(&self, uri: &str) -> ClientResult<ReadResourceResult> {
        self.request(methods::RESOURCES_READ, Some(json!({ "uri": uri })))
            .await
    }

    pub async fn list_prompts(&self) -> ClientResult<Vec<Prompt>> {
        let result: ListPromptsResult = self.request(methods::PROMPTS_LIST, None).await?;
        Ok(result.prompts)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> ClientResult<GetPromptResult> {
        self.request(
            methods::PROMPTS_GET,
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    pub async fn ping(&self) -> ClientResult<()> {
        let _: Value = self.request(methods::PING, None).await?;
        Ok(())
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> ClientResult<T> {
        let transport = self.transport.read().clone();
        let transport = match (self.state(), transport) {
            (ClientState::Ready, Some(transport)) => transport,
            _ => return Err(ClientError::NotConnected),
        };

        let result = match self.round_trip(transport.as_ref(), method, params).await {
            Ok(result) => result,
            Err(e) => {
                if matches!(e, ClientError::Transport(_) | ClientError::Timeout(_)) {
                    warn!("Request {} failed, marking connection broken: {}", method, e);
                    *self.state.write() = ClientState::Error;
                }
                return Err(e);
            }
        };

        serde_json::from_value(result).map_err(|e| ClientError::MalformedResponse(e.to_string()))
    }

    async fn round_trip(
        &self,
        transport: &dyn ClientTransport,
        method: &str,
        params: Option<Value>,
    ) -> ClientResult<Value> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (timeout, credential) = {
            let options = self.options.read();
            (options.request_timeout, options.credential.clone())
        };
        let params = attach_credential(params, credential.as_ref());
        let request = codec::create_request(id.clone(), method, params);

        debug!("Sending {} ({})", method, id);
        let response = tokio::time::timeout(timeout, transport.request(request))
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;

        if response.id != id {
            return Err(ClientError::MalformedResponse(format!(
                "expected response to {id}, got {}",
                response.id
            )));
        }
        if let Some(error) = response.error {
            return Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        response
            .result
            .ok_or_else(|| ClientError::MalformedResponse("response without result".into()))
    }
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new(Arc::new(DefaultConnector))
    }
}

/// Put `credential` under `params._auth`. Non-object params are left alone.
fn attach_credential(params: Option<Value>, credential: Option<&Value>) -> Option<Value> {
    let Some(credential) = credential else {
        return params;
    };
    match params.unwrap_or_else(|| Value::Object(Default::default())) {
        Value::Object(mut map) => {
            map.insert(AUTH_PARAM_KEY.to_string(), credential.clone());
            Some(Value::Object(map))
        }
        other => Some(other),
    }
}

async fn close_quietly(transport: &dyn ClientTransport) {
    if let Err(e) = transport.close().await {
        warn!("Error closing transport: {}", e);
    }
}
