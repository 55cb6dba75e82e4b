//! Configuration types and builders.

use crate::error::{ConfigError, McpError, Result};
use crate::protocol::types::{ClientInfo, MCP_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::env;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: Cow<'static, str>,
    pub version: Cow<'static, str>,
    /// Prefix applied to built-in tool names.
    pub tool_prefix: String,
    pub instructions: Option<String>,
    /// Accepted protocol versions, newest first.
    pub protocol_versions: Vec<String>,
    /// Reject tool/resource/prompt calls before `initialize`.
    pub strict_initialization: bool,
    /// Bearer tokens accepted in `params._auth`. Empty disables auth.
    #[serde(skip_serializing)]
    pub auth_tokens: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "open-agents-mcp".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            tool_prefix: String::new(),
            instructions: None,
            protocol_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            strict_initialization: false,
            auth_tokens: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Echo the client's version if supported, otherwise answer with our newest.
    pub fn negotiate_protocol(&self, requested: &str) -> String {
        if self.protocol_versions.iter().any(|v| v == requested) {
            requested.to_string()
        } else {
            self.protocol_versions
                .first()
                .cloned()
                .unwrap_or_else(|| MCP_VERSION.to_string())
        }
    }
}

/// Builder for ServerConfig.
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<Cow<'static, str>>) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn tool_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.tool_prefix = prefix.into();
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.config.instructions = Some(instructions.into());
        self
    }

    pub fn strict_initialization(mut self, strict: bool) -> Self {
        self.config.strict_initialization = strict;
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_tokens.push(token.into());
        self
    }

    /// Override from `MCP_SERVER_NAME`, `MCP_TOOL_PREFIX`, `MCP_STRICT_INIT`
    /// and `MCP_AUTH_TOKENS` (comma separated).
    pub fn from_env(mut self) -> Result<Self> {
        if let Ok(name) = env::var("MCP_SERVER_NAME") {
            self.config.name = name.into();
        }

        if let Ok(prefix) = env::var("MCP_TOOL_PREFIX") {
            self.config.tool_prefix = prefix;
        }

        if let Ok(strict) = env::var("MCP_STRICT_INIT") {
            self.config.strict_initialization = strict.parse().map_err(|_| {
                McpError::Config(ConfigError::InvalidValue {
                    field: "MCP_STRICT_INIT".into(),
                    message: "expected true or false".into(),
                })
            })?;
        }

        if let Ok(tokens) = env::var("MCP_AUTH_TOKENS") {
            self.config.auth_tokens = tokens
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }

        Ok(self)
    }

    pub fn build(self) -> Result<ServerConfig> {
        if self.config.name.is_empty() {
            return Err(ConfigError::MissingField("name".into()).into());
        }
        if self.config.protocol_versions.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "protocol_versions".into(),
                message: "at least one protocol version is required".into(),
            }
            .into());
        }
        Ok(self.config)
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Default per-server connection ceiling.
    pub max_connections: usize,
    /// How long a released connection may sit idle before it is closed.
    pub idle_timeout: Duration,
    /// How long `acquire` waits for a connection at the ceiling.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }
}

/// Builder for PoolConfig with fluent API.
#[derive(Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Override from `MCP_POOL_MAX_CONNECTIONS`, `MCP_POOL_IDLE_TIMEOUT_MS`
    /// and `MCP_POOL_ACQUIRE_TIMEOUT_MS`.
    pub fn from_env(mut self) -> Result<Self> {
        if let Ok(max) = env::var("MCP_POOL_MAX_CONNECTIONS") {
            self.config.max_connections = parse_env("MCP_POOL_MAX_CONNECTIONS", &max)?;
        }

        if let Ok(ms) = env::var("MCP_POOL_IDLE_TIMEOUT_MS") {
            self.config.idle_timeout =
                Duration::from_millis(parse_env("MCP_POOL_IDLE_TIMEOUT_MS", &ms)?);
        }

        if let Ok(ms) = env::var("MCP_POOL_ACQUIRE_TIMEOUT_MS") {
            self.config.acquire_timeout =
                Duration::from_millis(parse_env("MCP_POOL_ACQUIRE_TIMEOUT_MS", &ms)?);
        }

        Ok(self)
    }

    pub fn build(self) -> Result<PoolConfig> {
        if self.config.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_connections".into(),
                message: "Max connections must be greater than 0".into(),
            }
            .into());
        }
        Ok(self.config)
    }
}

fn parse_env<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        McpError::Config(ConfigError::InvalidValue {
            field: field.into(),
            message: format!("invalid number: {value}").into(),
        })
    })
}

/// Options for an outbound client connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_info: ClientInfo,
    pub protocol_version: String,
    /// Upper bound for each request round trip, including `initialize`.
    pub request_timeout: Duration,
    /// Sent as `params._auth` on every request and notification.
    pub credential: Option<Value>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_info: ClientInfo {
                name: "open-agents-mcp-client".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
            protocol_version: MCP_VERSION.into(),
            request_timeout: Duration::from_secs(30),
            credential: None,
        }
    }
}

impl ConnectOptions {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_credential(mut self, credential: impl Into<Value>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_info = ClientInfo {
            name: name.into(),
            version: version.into(),
        };
        self
    }
}

/// A logical upstream server registered with the pool.
#[derive(Debug, Clone)]
pub struct PoolServerConfig {
    pub id: String,
    pub uri: String,
    pub connect_options: ConnectOptions,
    pub min_connections: Option<usize>,
    pub max_connections: Option<usize>,
}

impl PoolServerConfig {
    pub fn new(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            connect_options: ConnectOptions::default(),
            min_connections: None,
            max_connections: None,
        }
    }

    pub fn with_connect_options(mut self, options: ConnectOptions) -> Self {
        self.connect_options = options;
        self
    }

    pub fn with_min_connections(mut self, min: usize) -> Self {
        self.min_connections = Some(min);
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::builder()
            .name("test-server")
            .tool_prefix("t_")
            .auth_token("secret")
            .build()
            .unwrap();

        assert_eq!(config.name, "test-server");
        assert_eq!(config.tool_prefix, "t_");
        assert_eq!(config.auth_tokens, vec!["secret"]);
        assert!(!config.strict_initialization);
    }

    #[test]
    fn test_negotiate_protocol() {
        let config = ServerConfig::default();
        assert_eq!(config.negotiate_protocol("2024-11-05"), "2024-11-05");
        assert_eq!(config.negotiate_protocol("1999-01-01"), MCP_VERSION);
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_pool_config_validation() {
        assert!(PoolConfig::builder().max_connections(0).build().is_err());
        let config = PoolConfig::builder()
            .max_connections(2)
            .acquire_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        assert!(parse_env::<usize>("X", "abc").is_err());
        assert_eq!(parse_env::<u64>("X", " 250 ").unwrap(), 250);
    }
}
