//! Error types for the MCP runtime.
//!
//! Uses `thiserror` for ergonomic error definitions with automatic `From` conversions.

use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC 2.0 standard error codes plus the application-reserved ones.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const UNAUTHORIZED: i32 = -32000;
    pub const NOT_INITIALIZED: i32 = -32002;
}

/// Main error type for the MCP runtime.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: Cow<'static, str> },
}

/// JSON-RPC 2.0 and MCP protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Parse error")]
    ParseError,

    #[error("Invalid request: {0}")]
    InvalidRequest(Cow<'static, str>),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(Cow<'static, str>),

    #[error("Internal error: {0}")]
    InternalError(Cow<'static, str>),

    #[error("Unauthorized: {0}")]
    Unauthorized(Cow<'static, str>),

    #[error("Server not initialized")]
    NotInitialized,
}

impl ProtocolError {
    /// Returns the JSON-RPC 2.0 error code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => codes::PARSE_ERROR,
            Self::InvalidRequest(_) => codes::INVALID_REQUEST,
            Self::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::InternalError(_) => codes::INTERNAL_ERROR,
            Self::Unauthorized(_) => codes::UNAUTHORIZED,
            Self::NotInitialized => codes::NOT_INITIALIZED,
        }
    }
}

/// Errors raised while moving bytes across a channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

/// Errors surfaced by the outbound client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client is not connected")]
    NotConnected,

    #[error("Unsupported server URI: {0}")]
    InvalidUri(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Server returned error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::MalformedResponse(e.to_string())
    }
}

/// Connection pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Timed out after {timeout:?} waiting for a connection to '{server_id}'")]
    AcquireTimeout { server_id: String, timeout: Duration },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Server not registered: {0}")]
    ServerNotRegistered(String),

    #[error("Server '{0}' was unregistered while waiting for a connection")]
    ServerUnregistered(String),

    #[error("Failed to connect to '{server_id}': {source}")]
    Connect {
        server_id: String,
        #[source]
        source: ClientError,
    },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(Cow<'static, str>),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: Cow<'static, str>,
        message: Cow<'static, str>,
    },
}

/// Tool execution errors.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Missing required argument: {0}")]
    MissingArgument(Cow<'static, str>),
}

/// Result type alias for McpError.
pub type Result<T> = std::result::Result<T, McpError>;

/// Result type alias for ProtocolError.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Result type alias for TransportError.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type alias for ClientError.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Result type alias for PoolError.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_codes() {
        assert_eq!(ProtocolError::ParseError.code(), -32700);
        assert_eq!(ProtocolError::InvalidRequest("test".into()).code(), -32600);
        assert_eq!(ProtocolError::MethodNotFound("test".into()).code(), -32601);
        assert_eq!(ProtocolError::InvalidParams("test".into()).code(), -32602);
        assert_eq!(ProtocolError::InternalError("test".into()).code(), -32603);
        assert_eq!(ProtocolError::Unauthorized("test".into()).code(), -32000);
    }

    #[test]
    fn test_error_conversion() {
        let pool_error = PoolError::PoolClosed;
        let mcp_error: McpError = pool_error.into();
        assert!(matches!(mcp_error, McpError::Pool(_)));

        let client_error: ClientError = TransportError::Closed.into();
        assert!(matches!(client_error, ClientError::Transport(_)));
    }
}
