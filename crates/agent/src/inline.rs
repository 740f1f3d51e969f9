//! Inline tool calling for models without structured function calling.
//!
//! The model is told to write calls as
//!
//! ```text
//! <tool_call>{"name": "search", "arguments": {"q": "rust"}}</tool_call>
//! ```
//!
//! and reads results back as `<tool_response>` text in a user message.

use toolstream_core::backend::ToolDefinition;
use tracing::warn;

const CALL_OPEN: &str = "<tool_call>";
const CALL_CLOSE: &str = "</tool_call>";

/// A tool call recovered from model text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineToolCall {
    pub name: String,
    /// JSON object text; `{}` when the model gave none.
    pub arguments: String,
}

/// Extract every well-formed `<tool_call>` block from `text`, in order.
/// Unterminated or unparseable blocks are skipped.
pub fn parse_tool_calls(text: &str) -> Vec<InlineToolCall> {
    let mut calls = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(CALL_OPEN) {
        let after_open = &rest[start + CALL_OPEN.len()..];
        let Some(end) = after_open.find(CALL_CLOSE) else {
            break;
        };
        let body = strip_fence(after_open[..end].trim());
        match parse_body(body) {
            Some(call) => calls.push(call),
            None => warn!(body = %body, "Skipping malformed inline tool call"),
        }
        rest = &after_open[end + CALL_CLOSE.len()..];
    }

    calls
}

fn strip_fence(body: &str) -> &str {
    let body = body
        .strip_prefix("```json")
        .or_else(|| body.strip_prefix("```"))
        .unwrap_or(body);
    body.strip_suffix("```").unwrap_or(body).trim()
}

fn parse_body(body: &str) -> Option<InlineToolCall> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let name = value.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }

    let raw_args = value
        .get("arguments")
        .or_else(|| value.get("parameters"))
        .or_else(|| value.get("input"));

    let arguments = match raw_args {
        None | Some(serde_json::Value::Null) => "{}".to_string(),
        // Some models double-encode the arguments
        Some(serde_json::Value::String(s)) => match serde_json::from_str::<serde_json::Value>(s) {
            Ok(inner) => inner.to_string(),
            Err(_) => return None,
        },
        Some(other) => other.to_string(),
    };

    Some(InlineToolCall {
        name: name.to_string(),
        arguments,
    })
}

/// Render a tool result for the model to read.
pub fn format_tool_response(name: &str, text: &str, is_error: bool) -> String {
    if is_error {
        format!("<tool_response name=\"{name}\" error=\"true\">\n{text}\n</tool_response>")
    } else {
        format!("<tool_response name=\"{name}\">\n{text}\n</tool_response>")
    }
}

/// System-prompt section describing the available tools and the call format.
pub fn tool_instructions(tools: &[ToolDefinition]) -> String {
    let mut out = String::from(
        "## Tools\n\
         You can call tools. To call one, write exactly:\n\
         <tool_call>{\"name\": \"<tool name>\", \"arguments\": {<json arguments>}}</tool_call>\n\
         Then stop and wait. Results arrive as <tool_response> blocks.\n\n\
         Available tools:\n",
    );
    for tool in tools {
        out.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            tool.name, tool.description, tool.parameters
        ));
    }
    out
}
