//! Content blocks — the typed, status-tagged segments of the assistant
//! message a UI renders while it grows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::{ToolOutput, ToolServer};

/// Lifecycle status of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Loading,
    Success,
    Error,
    Cancel,
}

/// The tool-call payload of a `tool_call` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallBlock {
    pub id: String,
    pub name: String,
    /// JSON arguments; empty until the driver records the call.
    #[serde(default)]
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ToolServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ToolOutput>,
}

/// What a block holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Content { content: String },
    Reasoning { content: String },
    ToolCall(ToolCallBlock),
    Image { mime_type: String, data: String },
    Action { content: String },
    Error { message: String },
}

/// One element of the assistant message under construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(flatten)]
    pub kind: BlockKind,
    pub status: BlockStatus,
    pub timestamp: DateTime<Utc>,
}

impl ContentBlock {
    pub fn new(kind: BlockKind, status: BlockStatus) -> Self {
        Self {
            kind,
            status,
            timestamp: Utc::now(),
        }
    }

    /// Block type name as serialized.
    pub fn block_type(&self) -> &'static str {
        match self.kind {
            BlockKind::Content { .. } => "content",
            BlockKind::Reasoning { .. } => "reasoning",
            BlockKind::ToolCall(_) => "tool_call",
            BlockKind::Image { .. } => "image",
            BlockKind::Action { .. } => "action",
            BlockKind::Error { .. } => "error",
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == BlockStatus::Loading
    }

    /// The tool-call payload, if this is a `tool_call` block.
    pub fn as_tool_call(&self) -> Option<&ToolCallBlock> {
        match &self.kind {
            BlockKind::ToolCall(call) => Some(call),
            _ => None,
        }
    }

    /// Text carried by `content`, `reasoning`, `action` and `error` blocks.
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            BlockKind::Content { content }
            | BlockKind::Reasoning { content }
            | BlockKind::Action { content } => Some(content),
            BlockKind::Error { message } => Some(message),
            _ => None,
        }
    }
}
