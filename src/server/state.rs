//! Server state management.

use crate::config::ServerConfig;
use crate::error::{ConfigError, Result};
use crate::events::EventEmitter;
use crate::server::resources::{PromptRegistry, ResourceRegistry};
use crate::tools::ToolRegistry;
use std::sync::atomic::{AtomicU64, Ordering};

/// Everything a server session reads from: configuration, registries and
/// the event emitter shared with the dispatcher.
pub struct ServerState {
    pub config: ServerConfig,
    pub tools: ToolRegistry,
    pub resources: ResourceRegistry,
    pub prompts: PromptRegistry,
    pub events: EventEmitter,
    tool_calls: AtomicU64,
}

impl ServerState {
    pub fn new(config: ServerConfig, events: EventEmitter) -> Self {
        Self {
            config,
            tools: ToolRegistry::new(events.clone()),
            resources: ResourceRegistry::new(),
            prompts: PromptRegistry::new(),
            events,
            tool_calls: AtomicU64::new(0),
        }
    }

    pub fn record_tool_call(&self) -> u64 {
        self.tool_calls.fetch_add(1, Ordering::SeqCst)
    }

    pub fn tool_call_count(&self) -> u64 {
        self.tool_calls.load(Ordering::SeqCst)
    }
}

pub struct ServerStateBuilder {
    config: Option<ServerConfig>,
    events: Option<EventEmitter>,
    builtins: bool,
}

impl ServerStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            events: None,
            builtins: false,
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    /// Register the built-in tools under the configured prefix.
    pub fn with_builtins(mut self) -> Self {
        self.builtins = true;
        self
    }

    pub fn build(self) -> Result<ServerState> {
        let config = self
            .config
            .ok_or_else(|| ConfigError::MissingField("config".into()))?;
        let events = self.events.unwrap_or_default();

        let state = ServerState::new(config, events);
        if self.builtins {
            crate::tools::register_builtins(&state.tools, &state.config.tool_prefix);
        }
        Ok(state)
    }
}

impl Default for ServerStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
