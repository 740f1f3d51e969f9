//! Built-in tools available to `toolstream run`.

use async_trait::async_trait;
use toolstream_core::error::ToolError;
use toolstream_core::tool::{Tool, ToolContent, ToolOutput, ToolRegistry};

/// Echoes its `text` argument back, or the whole argument object.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back unchanged"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo" }
            }
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        match arguments.get("text") {
            Some(serde_json::Value::String(text)) => Ok(ToolOutput::text(text.clone())),
            Some(other) => Err(ToolError::InvalidArguments(format!(
                "echo: 'text' must be a string, got {other}"
            ))),
            None => Ok(ToolOutput {
                content: vec![ToolContent::Json { value: arguments }],
                is_error: false,
            }),
        }
    }
}

/// The registry of built-in tools.
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(EchoTool));
    registry
}
