//! Terminal session data handed to consumers when a session ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::Usage;
use crate::block::ContentBlock;
use crate::message::{Conversation, SessionId};

/// How a session's agent loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    /// The model finished without requesting (more) tools.
    Natural,
    /// The tool-call ceiling was reached.
    Bounded,
    /// The caller cancelled the session.
    Cancelled,
    /// The backend failed or the loop hit an unexpected fault.
    Error,
}

/// Latency metadata for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub started_at: DateTime<Utc>,
    /// Milliseconds from start to the first model output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_token_ms: Option<i64>,
    /// Milliseconds between the first and last reasoning event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_ms: Option<i64>,
    pub total_ms: i64,
}

/// Everything a consumer needs to persist a finished session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub reason: DoneReason,
    pub history: Conversation,
    pub blocks: Vec<ContentBlock>,
    pub usage: Usage,
    pub tool_call_count: u32,
    pub iterations: u32,
    pub metrics: SessionMetrics,
}

impl SessionSummary {
    pub fn cancelled(&self) -> bool {
        self.reason == DoneReason::Cancelled
    }
}
