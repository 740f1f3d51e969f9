//! Session-level streaming events.
//!
//! `SessionEvent` wraps canonical stream events with the two summary event
//! types a caller needs: a fatal `error` and the terminal `end`.

use serde::{Deserialize, Serialize};
use toolstream_core::message::SessionId;
use toolstream_core::session::{DoneReason, SessionMetrics};
use toolstream_core::stream::CanonicalEvent;

/// Events delivered to the caller of `start_session`.
///
/// Wire shape is `{"type": ..., "data": ...}`:
/// - `response` — one canonical event, in stream order
/// - `error`    — a fatal failure; at most one per session
/// - `end`      — always last, for natural, bounded, failed and cancelled runs
///
/// An `end` does not imply success; check for a preceding `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    Response(CanonicalEvent),

    Error { message: String },

    End {
        session_id: SessionId,
        cancelled: bool,
        reason: DoneReason,
        metrics: SessionMetrics,
    },
}

impl SessionEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Response(_) => "response",
            Self::Error { .. } => "error",
            Self::End { .. } => "end",
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::End { .. })
    }
}
