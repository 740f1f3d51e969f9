//! Stream session registry — admission control and cancellation for all
//! in-flight sessions.
//!
//! The session table is the only state shared across sessions. Every
//! admitted session gets a [`SessionGuard`]; dropping the guard is the one
//! and only way a session leaves the table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use toolstream_config::OrchestratorConfig;
use toolstream_core::error::AdmissionError;
use toolstream_core::message::SessionId;
use tracing::{debug, info, warn};

use crate::driver::{AgentLoopDriver, DriverContext, SessionRequest};
use crate::stream_event::SessionEvent;

/// Per-session control handle kept in the table.
struct SessionHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

type SessionTable = Arc<Mutex<HashMap<SessionId, SessionHandle>>>;

/// Removes its session from the table when dropped and wakes `stop_all`.
pub struct SessionGuard {
    table: SessionTable,
    session_id: SessionId,
    done: watch::Sender<bool>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let removed = self
            .table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.session_id)
            .is_some();
        self.done.send_replace(true);
        debug!(session_id = %self.session_id, removed, "Session left registry");
    }
}

/// Tracks one agent loop per in-flight session.
#[derive(Clone)]
pub struct StreamSessionRegistry {
    sessions: SessionTable,
    ctx: DriverContext,
    max_sessions: usize,
    event_buffer: usize,
}

impl StreamSessionRegistry {
    /// Create a registry with limits taken from `config`.
    pub fn new(ctx: DriverContext, config: &OrchestratorConfig) -> Self {
        Self::with_limits(ctx, config.max_concurrent_sessions, config.event_buffer)
    }

    pub fn with_limits(ctx: DriverContext, max_sessions: usize, event_buffer: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ctx,
            max_sessions: max_sessions.max(1),
            event_buffer: event_buffer.max(1),
        }
    }

    /// Admit and spawn a session, returning its event stream.
    ///
    /// Rejected when the registry is at capacity or the id is already
    /// running; a rejection creates nothing.
    pub fn try_start(&self, request: SessionRequest) -> Result<ReceiverStream<SessionEvent>, AdmissionError> {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let driver = self.admit(request)?.with_events(tx);
        tokio::spawn(driver.run());
        Ok(ReceiverStream::new(rx))
    }

    /// Like [`try_start`](Self::try_start), but a rejection arrives as a
    /// stream holding a single `error` event.
    pub fn start_session(&self, request: SessionRequest) -> ReceiverStream<SessionEvent> {
        self.try_start(request).unwrap_or_else(|e| {
            let (tx, rx) = mpsc::channel(1);
            // Capacity 1 and a fresh channel: this cannot fail.
            let _ = tx.try_send(SessionEvent::Error { message: e.to_string() });
            ReceiverStream::new(rx)
        })
    }

    /// Admit and spawn a session whose output goes to the bridge only.
    /// Returns false when the session was not admitted; nothing is sent to
    /// the bridge in that case, so the caller must report the rejection.
    pub fn start(&self, request: SessionRequest) -> bool {
        match self.admit(request) {
            Ok(driver) => {
                tokio::spawn(driver.run());
                true
            }
            Err(_) => false,
        }
    }

    /// Request cooperative cancellation. Returns whether the session was
    /// active; calling it again has no further effect.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get(session_id) {
            Some(handle) => {
                if !handle.cancel.is_cancelled() {
                    info!(session_id = %session_id, "Cancelling session");
                    handle.cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(session_id)
    }

    /// Number of sessions currently in the table.
    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Ids of all sessions currently in the table.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Cancel every active session and wait until each has terminated.
    pub async fn stop_all(&self) {
        let waiters: Vec<watch::Receiver<bool>> = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions
                .values()
                .map(|handle| {
                    handle.cancel.cancel();
                    handle.done.clone()
                })
                .collect()
        };

        info!(sessions = waiters.len(), "Stopping all sessions");
        for mut done in waiters {
            // Err means the guard is gone, which also means the session ended.
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    fn admit(&self, request: SessionRequest) -> Result<AgentLoopDriver, AdmissionError> {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if sessions.contains_key(&request.session_id) {
                warn!(session_id = %request.session_id, "Rejected duplicate session");
                return Err(AdmissionError::DuplicateSession(request.session_id.to_string()));
            }
            if sessions.len() >= self.max_sessions {
                warn!(
                    session_id = %request.session_id,
                    limit = self.max_sessions,
                    "Rejected session: concurrency cap reached"
                );
                return Err(AdmissionError::CapacityReached {
                    limit: self.max_sessions,
                });
            }
            sessions.insert(
                request.session_id.clone(),
                SessionHandle {
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
            debug!(session_id = %request.session_id, active = sessions.len(), "Session admitted");
        }

        let guard = SessionGuard {
            table: self.sessions.clone(),
            session_id: request.session_id.clone(),
            done: done_tx,
        };
        Ok(AgentLoopDriver::new(self.ctx.clone(), request, cancel).with_guard(guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use toolstream_core::backend::{ModelRef, RawDelta};
    use toolstream_core::bridge::NoopBridge;
    use toolstream_core::message::Conversation;
    use toolstream_core::tool::ToolRegistry;
    use toolstream_providers::ScriptedBackend;
    use tokio_stream::StreamExt;

    fn registry(backend: ScriptedBackend, max_sessions: usize) -> StreamSessionRegistry {
        registry_with_buffer(backend, max_sessions, 32)
    }

    fn registry_with_buffer(backend: ScriptedBackend, max_sessions: usize, buffer: usize) -> StreamSessionRegistry {
        let ctx = DriverContext {
            backend: Arc::new(backend),
            executor: Arc::new(ToolRegistry::new()),
            bridge: Arc::new(NoopBridge),
            max_tool_calls: 20,
            native_tool_calling: true,
        };
        StreamSessionRegistry::with_limits(ctx, max_sessions, buffer)
    }

    fn chatty_backend() -> ScriptedBackend {
        let mut deltas: Vec<_> = (0..20)
            .map(|i| RawDelta::Text { text: format!("t{i} ") })
            .collect();
        deltas.push(RawDelta::Stop { reason: "end_turn".into() });
        ScriptedBackend::from_deltas(vec![deltas])
    }

    fn request(id: &str) -> SessionRequest {
        SessionRequest::new(
            SessionId::from(id),
            Conversation::from_messages(vec![toolstream_core::Message::user("hi")]),
            ModelRef::new("scripted", "replay"),
        )
    }

    fn slow_backend() -> ScriptedBackend {
        ScriptedBackend::from_deltas(vec![vec![
            RawDelta::Text { text: "a".into() },
            RawDelta::Text { text: "b".into() },
            RawDelta::Stop { reason: "end_turn".into() },
        ]])
        .repeating_last()
        .with_delay(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn session_removed_before_stream_closes() {
        let reg = registry(
            ScriptedBackend::from_deltas(vec![vec![RawDelta::Text { text: "Hi".into() }]]),
            4,
        );
        let mut stream = reg.try_start(request("a")).unwrap();
        let mut last = None;
        while let Some(event) = stream.next().await {
            last = Some(event);
        }
        assert!(last.unwrap().is_end());
        assert!(!reg.is_active(&SessionId::from("a")));
        assert_eq!(reg.active_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_ids_rejected() {
        let reg = registry(slow_backend(), 4);
        let _first = reg.try_start(request("dup")).unwrap();
        let err = reg.try_start(request("dup")).unwrap_err();
        assert_eq!(err, AdmissionError::DuplicateSession("dup".into()));
        assert_eq!(reg.active_count(), 1);
        reg.stop_all().await;
    }

    #[tokio::test]
    async fn start_returns_false_at_capacity() {
        let reg = registry(slow_backend(), 1);
        assert!(reg.start(request("a")));
        assert!(!reg.start(request("b")));
        assert!(!reg.is_active(&SessionId::from("b")));
        reg.stop_all().await;
        assert_eq!(reg.active_count(), 0);
    }

    #[tokio::test]
    async fn cancel_unknown_session_is_noop() {
        let reg = registry(slow_backend(), 1);
        assert!(!reg.cancel(&SessionId::from("ghost")));
    }

    #[tokio::test]
    async fn stop_all_waits_for_termination() {
        let reg = registry(slow_backend(), 3);
        let streams: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|id| reg.try_start(request(id)).unwrap())
            .collect();
        assert_eq!(reg.active_count(), 3);

        reg.stop_all().await;
        assert_eq!(reg.active_count(), 0);

        for stream in streams {
            let events: Vec<_> = stream.collect().await;
            match events.last() {
                Some(SessionEvent::End { cancelled, .. }) => assert!(*cancelled),
                other => panic!("expected end event, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn stop_all_finishes_sessions_whose_caller_stopped_reading() {
        let reg = registry_with_buffer(chatty_backend(), 4, 1);
        let held = reg.try_start(request("stalled")).unwrap();

        // Give the driver time to fill the one-slot channel and block on it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reg.is_active(&SessionId::from("stalled")));

        tokio::time::timeout(Duration::from_secs(3), reg.stop_all())
            .await
            .expect("stop_all hung on a session with a full caller channel");
        assert_eq!(reg.active_count(), 0);

        // The caller still gets `end` once it resumes reading.
        let events: Vec<_> = tokio::time::timeout(Duration::from_secs(3), held.collect())
            .await
            .unwrap();
        match events.last() {
            Some(SessionEvent::End { cancelled, .. }) => assert!(*cancelled),
            other => panic!("expected end event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stalled_caller_frees_its_slot_after_cancel() {
        let reg = registry_with_buffer(chatty_backend(), 1, 1);
        let _held = reg.try_start(request("stalled")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(reg.cancel(&SessionId::from("stalled")));
        tokio::time::timeout(Duration::from_secs(3), async {
            while reg.is_active(&SessionId::from("stalled")) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("cancelled session kept its registry slot");

        // The slot is free again for a new session.
        assert!(reg.try_start(request("next")).is_ok());
    }
}
