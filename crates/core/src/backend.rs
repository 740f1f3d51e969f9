//! ModelBackend trait — the abstraction over streaming LLM backends.
//!
//! A backend takes the conversation history, a model reference and the tool
//! catalog, and returns a channel of raw deltas. Raw deltas still carry the
//! per-vendor quirks (index-keyed argument fragments, missing end markers,
//! vendor finish-reason strings); the agent crate's normalizer irons those
//! out into canonical events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::message::Message;

/// Identifies a model on a backend, written as `provider/model`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parse `provider/model`. Everything after the first `/` is the model,
    /// so `openrouter/anthropic/claude` keeps the nested path.
    pub fn parse(s: &str) -> Option<Self> {
        let (provider, model) = s.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Add another usage record into this one. Totals only ever grow.
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

/// One streaming request to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRequest {
    /// Which model to run
    pub model: ModelRef,

    /// The conversation so far
    pub messages: Vec<Message>,

    /// Tools the model may call (empty when the catalog is empty)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Whether tools are advertised through structured tool calling. When
    /// false the backend is expected to describe them in the prompt and the
    /// model writes `<tool_call>` markers inline.
    #[serde(default)]
    pub native_tools: bool,
}

/// A raw, backend-specific stream delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawDelta {
    /// Visible text.
    Text { text: String },

    /// Thinking / reasoning text.
    Reasoning { text: String },

    /// A tool call begins. Some backends also number calls by stream index.
    ToolCallStart {
        id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
    },

    /// A fragment of a tool call's JSON arguments, keyed by id or by index.
    ToolCallArgs {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
        fragment: String,
    },

    /// A tool call is complete. `arguments` is set by backends that deliver
    /// the whole argument object at the end instead of (or as well as) fragments.
    ToolCallEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
    },

    /// Token usage, usually once per turn.
    Usage {
        prompt_tokens: u32,
        completion_tokens: u32,
        total_tokens: u32,
    },

    /// A complete inline image.
    Image { mime_type: String, data: String },

    /// Vendor finish reason (`stop`, `end_turn`, `tool_calls`, `length`, ...).
    Stop { reason: String },

    /// The backend reported an error mid-stream.
    Error { message: String },
}

/// The receiving half of a backend stream.
pub type DeltaReceiver = mpsc::Receiver<std::result::Result<RawDelta, BackendError>>;

/// The core ModelBackend trait.
///
/// Each vendor adapter is one implementation; the orchestrator only ever sees
/// this interface. Implementations must close the channel after a terminal
/// stop or error. No retry is performed by callers.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// A human-readable name for this backend (e.g., "openrouter", "scripted").
    fn name(&self) -> &str;

    /// Whether the model accepts structured tool definitions and emits
    /// structured tool-call deltas.
    fn supports_native_tools(&self, _model: &ModelRef) -> bool {
        true
    }

    /// Start streaming a completion.
    async fn stream_complete(
        &self,
        request: BackendRequest,
    ) -> std::result::Result<DeltaReceiver, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ref_parse() {
        let r = ModelRef::parse("openrouter/anthropic/claude-sonnet-4").unwrap();
        assert_eq!(r.provider, "openrouter");
        assert_eq!(r.model, "anthropic/claude-sonnet-4");
        assert_eq!(r.to_string(), "openrouter/anthropic/claude-sonnet-4");
        assert!(ModelRef::parse("no-slash").is_none());
        assert!(ModelRef::parse("/model").is_none());
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        assert!(total.is_empty());
        total.accumulate(&Usage::new(10, 5));
        total.accumulate(&Usage::new(3, 2));
        assert_eq!(total, Usage::new(13, 7));
        assert_eq!(total.total_tokens, 20);
    }

    #[test]
    fn raw_delta_fixture_format() {
        let json = r#"[
            {"type":"text","text":"Hi"},
            {"type":"tool_call_args","index":0,"fragment":"{\"q\":"},
            {"type":"stop","reason":"end_turn"}
        ]"#;
        let deltas: Vec<RawDelta> = serde_json::from_str(json).unwrap();
        assert_eq!(deltas.len(), 3);
        assert_eq!(
            deltas[1],
            RawDelta::ToolCallArgs {
                id: None,
                index: Some(0),
                fragment: "{\"q\":".into()
            }
        );
    }

    #[test]
    fn tool_definition_serialization() {
        let tool = ToolDefinition {
            name: "search".into(),
            description: "Search the index".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "q": { "type": "string" } },
                "required": ["q"]
            }),
        };
        let json = serde_json::to_string(&tool).unwrap();
        assert!(json.contains("search"));
        assert!(json.contains("\"q\""));
    }
}
