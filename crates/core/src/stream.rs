//! The canonical, vendor-neutral stream event vocabulary.

use serde::{Deserialize, Serialize};

use crate::backend::Usage;
use crate::message::MessageToolCall;

/// Why a model turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ToolUse,
    MaxTokens,
    StopSequence,
    Error,
    Complete,
}

impl StopReason {
    /// Map a vendor finish-reason string onto the canonical reasons.
    pub fn from_vendor(reason: &str) -> Self {
        match reason.trim().to_ascii_lowercase().as_str() {
            "tool_use" | "tool_calls" | "function_call" => Self::ToolUse,
            "max_tokens" | "length" => Self::MaxTokens,
            "stop_sequence" => Self::StopSequence,
            "error" => Self::Error,
            _ => Self::Complete,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::StopSequence => "stop_sequence",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }
}

/// One normalized stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    Text { content: String },
    Reasoning { content: String },
    ToolCallStart { id: String, name: String },
    ToolCallChunk { id: String, fragment: String },
    ToolCallEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
    },
    Usage(Usage),
    ImageData { mime_type: String, data: String },
    Error { message: String },
    Stop { reason: StopReason },
}

impl CanonicalEvent {
    /// Event name used on the wire.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Reasoning { .. } => "reasoning",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallChunk { .. } => "tool_call_chunk",
            Self::ToolCallEnd { .. } => "tool_call_end",
            Self::Usage(_) => "usage",
            Self::ImageData { .. } => "image_data",
            Self::Error { .. } => "error",
            Self::Stop { .. } => "stop",
        }
    }

    /// Whether this event carries model output (used for first-token latency).
    pub fn is_output(&self) -> bool {
        matches!(
            self,
            Self::Text { .. } | Self::Reasoning { .. } | Self::ToolCallStart { .. } | Self::ImageData { .. }
        )
    }
}

/// A tool call whose arguments have been fully assembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedToolCall {
    pub id: String,
    pub name: String,
    /// JSON arguments; `{}` when the model sent none.
    pub arguments: String,
}

impl From<&ResolvedToolCall> for MessageToolCall {
    fn from(call: &ResolvedToolCall) -> Self {
        MessageToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        }
    }
}
