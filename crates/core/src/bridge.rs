//! ConsumerBridge — the fan-out from running sessions to persistence and UI.
//!
//! Notifications are fire-and-forget: the driver calls them synchronously
//! from its own task and never waits on persistence. Implementations that do
//! slow work should hand off to a channel, as [`BroadcastBridge`] does.

use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::block::ContentBlock;
use crate::message::SessionId;
use crate::session::SessionSummary;
use crate::stream::CanonicalEvent;

/// Receives the canonical event stream and block snapshots of every session.
pub trait ConsumerBridge: Send + Sync {
    /// A canonical event was produced, in session order.
    fn on_event(&self, session_id: &SessionId, event: &CanonicalEvent);

    /// The block list of the in-progress assistant message changed.
    fn on_blocks_changed(&self, session_id: &SessionId, blocks: &[ContentBlock]);

    /// The session finished; the summary carries the final history.
    fn on_session_end(&self, _session_id: &SessionId, _summary: &SessionSummary) {}
}

/// A bridge that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBridge;

impl ConsumerBridge for NoopBridge {
    fn on_event(&self, _session_id: &SessionId, _event: &CanonicalEvent) {}
    fn on_blocks_changed(&self, _session_id: &SessionId, _blocks: &[ContentBlock]) {}
}

/// A notification as delivered by [`BroadcastBridge`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeNotification {
    Event {
        session_id: SessionId,
        event: CanonicalEvent,
    },
    Blocks {
        session_id: SessionId,
        blocks: Vec<ContentBlock>,
    },
    SessionEnd {
        session_id: SessionId,
        summary: Box<SessionSummary>,
    },
}

impl BridgeNotification {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Event { session_id, .. }
            | Self::Blocks { session_id, .. }
            | Self::SessionEnd { session_id, .. } => session_id,
        }
    }
}

/// A broadcast-based bridge.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Slow
/// subscribers lag and lose old notifications rather than stalling sessions.
pub struct BroadcastBridge {
    sender: broadcast::Sender<Arc<BridgeNotification>>,
}

impl BroadcastBridge {
    /// Create a new bridge with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to receive notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BridgeNotification>> {
        self.sender.subscribe()
    }

    fn publish(&self, notification: BridgeNotification) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(notification));
    }
}

impl Default for BroadcastBridge {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ConsumerBridge for BroadcastBridge {
    fn on_event(&self, session_id: &SessionId, event: &CanonicalEvent) {
        self.publish(BridgeNotification::Event {
            session_id: session_id.clone(),
            event: event.clone(),
        });
    }

    fn on_blocks_changed(&self, session_id: &SessionId, blocks: &[ContentBlock]) {
        self.publish(BridgeNotification::Blocks {
            session_id: session_id.clone(),
            blocks: blocks.to_vec(),
        });
    }

    fn on_session_end(&self, session_id: &SessionId, summary: &SessionSummary) {
        self.publish(BridgeNotification::SessionEnd {
            session_id: session_id.clone(),
            summary: Box::new(summary.clone()),
        });
    }
}
