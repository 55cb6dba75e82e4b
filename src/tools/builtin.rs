//! Tools: echo, current_time

use crate::define_tool;
use crate::error::ToolError;
use crate::protocol::{CallToolResult, Tool};
use crate::tools::registry::{ToolHandler, ToolResult};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct EchoArgs {
    pub message: Option<String>,
}

pub struct EchoTool;

impl EchoTool {
    pub fn definition(name: &str) -> Tool {
        define_tool!(
            name: name,
            description: "Echo the given message back to the caller.",
            schema: {
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "Text to echo"
                    }
                },
                "required": ["message"]
            }
        )
    }
}

#[async_trait]
impl ToolHandler for EchoTool {
    async fn call(&self, arguments: Value) -> ToolResult {
        let args: EchoArgs = serde_json::from_value(arguments)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let message = args
            .message
            .ok_or_else(|| ToolError::MissingArgument("message".into()))?;
        Ok(CallToolResult::text(message))
    }
}

pub struct CurrentTimeTool;

impl CurrentTimeTool {
    pub fn definition(name: &str) -> Tool {
        define_tool!(
            name: name,
            description: "Current UTC time in RFC 3339 format.",
            schema: { "type": "object", "properties": {} }
        )
    }
}

#[async_trait]
impl ToolHandler for CurrentTimeTool {
    async fn call(&self, _arguments: Value) -> ToolResult {
        Ok(CallToolResult::text(
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo() {
        let result = EchoTool.call(json!({"message": "hi"})).await.unwrap();
        assert_eq!(result.content[0].as_text(), Some("hi"));
        assert!(EchoTool.call(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_current_time() {
        let result = CurrentTimeTool.call(Value::Null).await.unwrap();
        let text = result.content[0].as_text().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(text).is_ok());
    }
}
