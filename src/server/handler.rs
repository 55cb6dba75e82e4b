//! MCP request handler implementation.

use crate::error::ProtocolResult;
use crate::protocol::{
    CallToolParams, CallToolResult, GetPromptParams, GetPromptResult, Handler, InitializeParams,
    InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult, PromptsCapability,
    ReadResourceParams, ReadResourceResult, ResourcesCapability, ServerCapabilities, ServerInfo,
    ToolsCapability,
};
use crate::server::state::ServerState;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// MCP request handler backed by the server's registries.
pub struct McpHandler {
    state: Arc<ServerState>,
}

impl McpHandler {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: Some(true),
            }),
            resources: Some(ResourcesCapability {
                subscribe: Some(false),
                list_changed: Some(false),
            }),
            prompts: Some(PromptsCapability {
                list_changed: Some(false),
            }),
        }
    }
}

#[async_trait]
impl Handler for McpHandler {
    async fn initialize(&self, params: InitializeParams) -> ProtocolResult<InitializeResult> {
        info!(
            "Initialize request from {} v{}",
            params.client_info.name, params.client_info.version
        );
        debug!("Client capabilities: {:?}", params.capabilities);

        let protocol_version = self.state.config.negotiate_protocol(&params.protocol_version);
        if protocol_version != params.protocol_version {
            info!(
                "Client requested protocol {}, answering with {}",
                params.protocol_version, protocol_version
            );
        }

        Ok(InitializeResult {
            protocol_version,
            capabilities: self.capabilities(),
            server_info: ServerInfo {
                name: self.state.config.name.to_string(),
                version: self.state.config.version.to_string(),
            },
            instructions: self.state.config.instructions.clone(),
        })
    }

    async fn initialized(&self) -> ProtocolResult<()> {
        info!("Server initialized successfully");
        Ok(())
    }

    async fn shutdown(&self) -> ProtocolResult<()> {
        info!("Shutdown request received");
        Ok(())
    }

    async fn list_tools(&self) -> ProtocolResult<ListToolsResult> {
        let tools = self.state.tools.list();
        debug!("Listing {} tools", tools.len());

        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(&self, params: CallToolParams) -> ProtocolResult<CallToolResult> {
        debug!("Tool call: {}", params.name);
        self.state.record_tool_call();
        Ok(self.state.tools.call(params).await)
    }

    async fn list_resources(&self) -> ProtocolResult<ListResourcesResult> {
        Ok(ListResourcesResult {
            resources: self.state.resources.list(),
            next_cursor: None,
        })
    }

    async fn read_resource(&self, params: ReadResourceParams) -> ProtocolResult<ReadResourceResult> {
        debug!("Reading resource: {}", params.uri);
        self.state.resources.read(&params.uri)
    }

    async fn list_prompts(&self) -> ProtocolResult<ListPromptsResult> {
        Ok(ListPromptsResult {
            prompts: self.state.prompts.list(),
            next_cursor: None,
        })
    }

    async fn get_prompt(&self, params: GetPromptParams) -> ProtocolResult<GetPromptResult> {
        debug!("Rendering prompt: {}", params.name);
        self.state.prompts.get(&params.name, &params.arguments)
    }
}
