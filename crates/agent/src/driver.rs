//! The agent loop driver — one instance per session.
//!
//! The loop follows an **Await → Stream → Decide → Execute** cycle:
//!
//! 1. **Check** cancellation and the tool-call ceiling
//! 2. **Stream** one model turn through the normalizer into the accumulator
//! 3. **Decide**: a `tool_use` stop with resolved calls continues, anything else ends
//! 4. **Execute** the calls one at a time, in model order, and rewrite history
//!
//! Whatever ends the loop, the same cleanup runs: blocks are finalized, a
//! final usage snapshot is sent (unless cancelled), the bridge gets the
//! session summary, `end` is sent, and the session leaves the registry.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use toolstream_core::backend::{BackendRequest, ModelBackend, ModelRef, Usage};
use toolstream_core::block::BlockStatus;
use toolstream_core::bridge::ConsumerBridge;
use toolstream_core::message::{Conversation, Message, MessageToolCall, Role, SessionId};
use toolstream_core::session::{DoneReason, SessionSummary};
use toolstream_core::stream::{CanonicalEvent, ResolvedToolCall, StopReason};
use toolstream_core::tool::{ToolCatalog, ToolExecutor, ToolOutput, ToolServer};
use tracing::{debug, info, warn};

use crate::accumulator::ConversationAccumulator;
use crate::inline;
use crate::normalizer::NormalizedStream;
use crate::registry::SessionGuard;
use crate::stream_event::SessionEvent;
use crate::token;

/// Text of the marker block appended when the tool-call ceiling stops a session.
pub const MAX_TOOL_CALLS_MARKER: &str = "Maximum tool calls reached";

/// Everything a caller supplies to start one session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub session_id: SessionId,
    pub history: Conversation,
    pub model: ModelRef,
    pub catalog: ToolCatalog,
}

impl SessionRequest {
    pub fn new(session_id: SessionId, history: Conversation, model: ModelRef) -> Self {
        Self {
            session_id,
            history,
            model,
            catalog: ToolCatalog::new(),
        }
    }

    /// Set the tools the model may call.
    pub fn with_catalog(mut self, catalog: ToolCatalog) -> Self {
        self.catalog = catalog;
        self
    }
}

/// Collaborators and limits shared by every session.
#[derive(Clone)]
pub struct DriverContext {
    pub backend: Arc<dyn ModelBackend>,
    pub executor: Arc<dyn ToolExecutor>,
    pub bridge: Arc<dyn ConsumerBridge>,
    pub max_tool_calls: u32,
    /// Use structured tool calling when the backend supports it. When off,
    /// every model gets the inline `<tool_call>` protocol.
    pub native_tool_calling: bool,
}

/// Driver states, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingModel,
    Streaming,
    DecidingContinuation,
    ExecutingTools,
    Done(DoneReason),
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingModel => write!(f, "awaiting_model"),
            Self::Streaming => write!(f, "streaming"),
            Self::DecidingContinuation => write!(f, "deciding_continuation"),
            Self::ExecutingTools => write!(f, "executing_tools"),
            Self::Done(reason) => write!(f, "done({reason:?})"),
        }
    }
}

/// Runs one session's agent loop to completion.
pub struct AgentLoopDriver {
    ctx: DriverContext,
    session_id: SessionId,
    history: Conversation,
    model: ModelRef,
    catalog: ToolCatalog,
    native_tools: bool,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<SessionEvent>>,
    accumulator: ConversationAccumulator,
    tool_call_count: u32,
    iterations: u32,
    state: LoopState,
    guard: Option<SessionGuard>,
}

impl AgentLoopDriver {
    pub fn new(ctx: DriverContext, request: SessionRequest, cancel: CancellationToken) -> Self {
        let native_tools = ctx.native_tool_calling && ctx.backend.supports_native_tools(&request.model);
        Self {
            ctx,
            session_id: request.session_id,
            history: request.history,
            model: request.model,
            catalog: request.catalog,
            native_tools,
            cancel,
            events: None,
            accumulator: ConversationAccumulator::new(),
            tool_call_count: 0,
            iterations: 0,
            state: LoopState::AwaitingModel,
            guard: None,
        }
    }

    /// Send `SessionEvent`s to a caller in addition to the bridge.
    pub fn with_events(mut self, events: mpsc::Sender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Release `guard` once the terminal `end` event has been sent.
    pub(crate) fn with_guard(mut self, guard: SessionGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Run the loop and the cleanup path. Never panics out; never fails.
    pub async fn run(mut self) -> SessionSummary {
        info!(
            session_id = %self.session_id,
            model = %self.model,
            messages = self.history.len(),
            tools = self.catalog.len(),
            native_tools = self.native_tools,
            "Starting session"
        );

        let reason = match AssertUnwindSafe(self.run_loop()).catch_unwind().await {
            Ok(reason) => reason,
            Err(panic) => {
                let message = panic_message(&*panic);
                warn!(session_id = %self.session_id, error = %message, "Agent loop panicked");
                self.emit(CanonicalEvent::Error {
                    message: format!("Unexpected failure: {message}"),
                })
                .await;
                DoneReason::Error
            }
        };

        self.finalize(reason).await
    }

    async fn run_loop(&mut self) -> DoneReason {
        loop {
            self.transition(LoopState::AwaitingModel);

            if self.cancel.is_cancelled() {
                return DoneReason::Cancelled;
            }
            if self.tool_call_count >= self.ctx.max_tool_calls {
                self.bound_reached();
                return DoneReason::Bounded;
            }

            self.iterations += 1;
            debug!(
                session_id = %self.session_id,
                iteration = self.iterations,
                tool_calls = self.tool_call_count,
                "Agent loop iteration"
            );

            let request = self.build_request();
            let cancel = self.cancel.clone();
            let started = tokio::select! {
                biased;
                _ = cancel.cancelled() => return DoneReason::Cancelled,
                started = self.ctx.backend.stream_complete(request) => started,
            };
            let rx = match started {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Backend failed to start stream");
                    self.emit(CanonicalEvent::Error { message: e.to_string() }).await;
                    return DoneReason::Error;
                }
            };

            self.transition(LoopState::Streaming);
            let mut stream = NormalizedStream::new(rx, self.native_tools);
            let mut saw_usage = false;

            let stop = loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return DoneReason::Cancelled,
                    next = stream.next() => next,
                };
                match next {
                    Some(CanonicalEvent::Stop { reason }) => {
                        self.emit(CanonicalEvent::Stop { reason }).await;
                        break reason;
                    }
                    Some(CanonicalEvent::Usage(usage)) => {
                        saw_usage = true;
                        self.record_usage(&usage).await;
                    }
                    Some(event) => self.emit(event).await,
                    None => break StopReason::Complete,
                }
            };

            if !saw_usage {
                let estimate = token::estimate_turn_usage(
                    &self.history.messages,
                    &self.catalog.definitions(),
                    &stream.normalizer().completion_text(),
                );
                debug!(session_id = %self.session_id, tokens = estimate.total_tokens, "Using estimated usage");
                self.accumulator.add_usage(&estimate);
            }

            if self.cancel.is_cancelled() {
                return DoneReason::Cancelled;
            }

            self.transition(LoopState::DecidingContinuation);
            let text = stream.normalizer().text().to_string();
            let reasoning = stream.normalizer().reasoning().to_string();
            let calls = stream.normalizer_mut().take_tool_calls();

            match stop {
                StopReason::Error => return DoneReason::Error,
                StopReason::ToolUse if !calls.is_empty() => {}
                StopReason::ToolUse => {
                    warn!(session_id = %self.session_id, "tool_use stop without resolved tool calls");
                    return DoneReason::Natural;
                }
                _ => {
                    if !text.is_empty() || !reasoning.is_empty() {
                        self.history.push(assistant_message(text, reasoning, &[], false));
                    }
                    return DoneReason::Natural;
                }
            }

            self.history
                .push(assistant_message(text, reasoning, &calls, self.native_tools));

            self.transition(LoopState::ExecutingTools);
            if let Some(reason) = self.execute_tools(&calls).await {
                return reason;
            }
        }
    }

    async fn execute_tools(&mut self, calls: &[ResolvedToolCall]) -> Option<DoneReason> {
        debug!(session_id = %self.session_id, tool_count = calls.len(), "Executing tool calls");

        for call in calls {
            if self.cancel.is_cancelled() {
                return Some(DoneReason::Cancelled);
            }
            if self.tool_call_count >= self.ctx.max_tool_calls {
                self.bound_reached();
                return Some(DoneReason::Bounded);
            }
            self.tool_call_count += 1;

            let Some(server) = self.catalog.resolve(&call.name).cloned() else {
                warn!(session_id = %self.session_id, tool = %call.name, "Model called an unknown tool");
                let output = ToolOutput::error(format!("Tool '{}' is not available", call.name));
                self.record_tool_result(call, None, output);
                continue;
            };

            let started = std::time::Instant::now();
            let output = match self.ctx.executor.call(&call.name, &call.arguments, &server).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(session_id = %self.session_id, tool = %call.name, error = %e, "Tool execution failed");
                    ToolOutput::error(e.to_string())
                }
            };
            debug!(
                session_id = %self.session_id,
                tool = %call.name,
                is_error = output.is_error,
                duration_ms = started.elapsed().as_millis() as u64,
                "Tool call finished"
            );
            self.record_tool_result(call, Some(&server), output);

            if self.cancel.is_cancelled() {
                return Some(DoneReason::Cancelled);
            }
        }

        None
    }

    /// Write a tool outcome into the blocks and the history.
    fn record_tool_result(&mut self, call: &ResolvedToolCall, server: Option<&ToolServer>, output: ToolOutput) {
        let text = output.to_text();
        let is_error = output.is_error;

        if self.native_tools {
            let content = if is_error { format!("Error: {text}") } else { text };
            let mut message = Message::tool_result(&call.id, content)
                .with_metadata("tool_name", serde_json::Value::String(call.name.clone()));
            if is_error {
                message = message.with_metadata("is_error", serde_json::Value::Bool(true));
            }
            self.history.push(message);
        } else {
            let response = inline::format_tool_response(&call.name, &text, is_error);
            self.history.append_to_last(Role::User, &response);
        }

        if self.accumulator.record_tool_result(call, server, output) {
            self.blocks_changed();
        }
    }

    fn bound_reached(&mut self) {
        warn!(
            session_id = %self.session_id,
            tool_calls = self.tool_call_count,
            limit = self.ctx.max_tool_calls,
            "Tool call ceiling reached"
        );
        self.accumulator.abandon_pending_tools(BlockStatus::Error);
        self.accumulator.push_marker(MAX_TOOL_CALLS_MARKER);
        self.blocks_changed();
    }

    async fn record_usage(&mut self, usage: &Usage) {
        self.accumulator.add_usage(usage);
        let snapshot = self.accumulator.usage();
        self.forward(CanonicalEvent::Usage(snapshot)).await;
    }

    /// Feed an event to the accumulator, then forward it.
    async fn emit(&mut self, event: CanonicalEvent) {
        if self.accumulator.apply(&event) {
            self.blocks_changed();
        }
        self.forward(event).await;
    }

    /// Notify the bridge and the caller of an event.
    async fn forward(&mut self, event: CanonicalEvent) {
        self.ctx.bridge.on_event(&self.session_id, &event);
        let session_event = match event {
            CanonicalEvent::Error { message } => SessionEvent::Error { message },
            other => SessionEvent::Response(other),
        };
        self.send(session_event).await;
    }

    /// Deliver an event to the caller. A full channel is waited on only
    /// until the session is cancelled; after that the event is dropped.
    async fn send(&mut self, event: SessionEvent) {
        let Some(tx) = &self.events else {
            return;
        };
        let delivered = match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(event)) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        debug!(session_id = %self.session_id, "Caller not reading; dropped event after cancellation");
                        return;
                    }
                    sent = tx.send(event) => sent.is_ok(),
                }
            }
        };
        if !delivered {
            debug!(session_id = %self.session_id, "Caller dropped the event stream");
            self.events = None;
        }
    }

    /// Deliver the terminal `end` and release the registry slot.
    ///
    /// If the caller is behind once the session is cancelled, the slot is
    /// released first and `end` waits for the caller to read or drop the
    /// stream, so a stalled caller never pins the registry.
    async fn send_end(&mut self, end: SessionEvent) {
        let Some(tx) = self.events.take() else {
            drop(self.guard.take());
            return;
        };
        let end = match tx.try_send(end) {
            Ok(()) | Err(TrySendError::Closed(_)) => {
                drop(self.guard.take());
                return;
            }
            Err(TrySendError::Full(end)) => end,
        };

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = tx.reserve() => Some(permit),
        };
        match permit {
            Some(Ok(permit)) => {
                permit.send(end);
                drop(self.guard.take());
            }
            Some(Err(_)) => drop(self.guard.take()),
            None => {
                debug!(session_id = %self.session_id, "Caller not reading; leaving registry before end");
                drop(self.guard.take());
                let _ = tx.send(end).await;
            }
        }
    }

    fn blocks_changed(&self) {
        self.ctx
            .bridge
            .on_blocks_changed(&self.session_id, self.accumulator.blocks());
    }

    fn build_request(&self) -> BackendRequest {
        let tools = self.catalog.definitions();
        let mut messages = self.history.messages.clone();

        if !self.native_tools && !tools.is_empty() {
            let instructions = inline::tool_instructions(&tools);
            match messages.first_mut() {
                Some(first) if first.role == Role::System => {
                    first.content.push_str("\n\n");
                    first.content.push_str(&instructions);
                }
                _ => messages.insert(0, Message::system(instructions)),
            }
        }

        BackendRequest {
            model: self.model.clone(),
            messages,
            tools,
            native_tools: self.native_tools,
        }
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            debug!(session_id = %self.session_id, from = %self.state, to = %next, "State transition");
            self.state = next;
        }
    }

    async fn finalize(mut self, reason: DoneReason) -> SessionSummary {
        self.transition(LoopState::Done(reason));
        let cancelled = reason == DoneReason::Cancelled;

        if cancelled {
            self.accumulator.cancel();
        } else {
            self.accumulator.finish();
        }
        self.blocks_changed();

        if !cancelled {
            let snapshot = self.accumulator.usage();
            self.forward(CanonicalEvent::Usage(snapshot)).await;
        }

        let metrics = self.accumulator.metrics(Utc::now());
        let summary = SessionSummary {
            session_id: self.session_id.clone(),
            reason,
            history: self.history.clone(),
            blocks: self.accumulator.blocks().to_vec(),
            usage: self.accumulator.usage(),
            tool_call_count: self.tool_call_count,
            iterations: self.iterations,
            metrics: metrics.clone(),
        };
        self.ctx.bridge.on_session_end(&self.session_id, &summary);

        // Leaves the registry before the caller's stream closes.
        self.send_end(SessionEvent::End {
            session_id: self.session_id.clone(),
            cancelled,
            reason,
            metrics,
        })
        .await;

        info!(
            session_id = %self.session_id,
            reason = ?reason,
            iterations = self.iterations,
            tool_calls = self.tool_call_count,
            total_tokens = summary.usage.total_tokens,
            total_ms = summary.metrics.total_ms,
            "Session finished"
        );
        summary
    }
}

fn assistant_message(text: String, reasoning: String, calls: &[ResolvedToolCall], native: bool) -> Message {
    let mut message = Message::assistant(text);
    if native && !calls.is_empty() {
        message = message.with_tool_calls(calls.iter().map(MessageToolCall::from).collect());
    }
    if !reasoning.is_empty() {
        message = message.with_metadata("reasoning", serde_json::Value::String(reasoning));
    }
    message
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use toolstream_core::backend::{DeltaReceiver, RawDelta, ToolDefinition};
    use toolstream_core::bridge::NoopBridge;
    use toolstream_core::error::{BackendError, ToolError};

    /// Replays one delta list per call; records requests.
    struct MockBackend {
        turns: Mutex<Vec<Vec<RawDelta>>>,
        requests: Mutex<Vec<BackendRequest>>,
        native: bool,
    }

    impl MockBackend {
        fn new(turns: Vec<Vec<RawDelta>>) -> Self {
            Self {
                turns: Mutex::new(turns.into_iter().rev().collect()),
                requests: Mutex::new(vec![]),
                native: true,
            }
        }
    }

    #[async_trait]
    impl ModelBackend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }

        fn supports_native_tools(&self, _model: &ModelRef) -> bool {
            self.native
        }

        async fn stream_complete(&self, request: BackendRequest) -> Result<DeltaReceiver, BackendError> {
            self.requests.lock().unwrap().push(request);
            let turn = self
                .turns
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| BackendError::NotConfigured("script exhausted".into()))?;
            let (tx, rx) = mpsc::channel(64);
            for delta in turn {
                tx.try_send(Ok(delta)).unwrap();
            }
            Ok(rx)
        }
    }

    struct MockExecutor;

    #[async_trait]
    impl ToolExecutor for MockExecutor {
        async fn call(&self, name: &str, arguments: &str, _server: &ToolServer) -> Result<ToolOutput, ToolError> {
            match name {
                "fail" => Err(ToolError::ExecutionFailed {
                    tool_name: name.into(),
                    reason: "boom".into(),
                }),
                "panic" => panic!("tool exploded"),
                _ => Ok(ToolOutput::text(format!("{name}:{arguments}"))),
            }
        }
    }

    fn catalog(names: &[&str]) -> ToolCatalog {
        let server = ToolServer::new("local", "Local");
        let mut catalog = ToolCatalog::new();
        for name in names {
            catalog.add(
                ToolDefinition {
                    name: name.to_string(),
                    description: format!("{name} tool"),
                    parameters: serde_json::json!({"type": "object"}),
                },
                server.clone(),
            );
        }
        catalog
    }

    fn driver(backend: Arc<MockBackend>, max_tool_calls: u32, tools: &[&str]) -> AgentLoopDriver {
        let ctx = DriverContext {
            backend,
            executor: Arc::new(MockExecutor),
            bridge: Arc::new(NoopBridge),
            max_tool_calls,
            native_tool_calling: true,
        };
        let request = SessionRequest::new(
            SessionId::from("s"),
            Conversation::from_messages(vec![Message::user("hello")]),
            ModelRef::new("mock", "m"),
        )
        .with_catalog(catalog(tools));
        AgentLoopDriver::new(ctx, request, CancellationToken::new())
    }

    fn tool_turn(id: &str, name: &str) -> Vec<RawDelta> {
        vec![
            RawDelta::ToolCallStart { id: id.into(), name: name.into(), index: None },
            RawDelta::ToolCallArgs { id: Some(id.into()), index: None, fragment: "{}".into() },
            RawDelta::Stop { reason: "tool_use".into() },
        ]
    }

    fn text_turn(text: &str) -> Vec<RawDelta> {
        vec![
            RawDelta::Text { text: text.into() },
            RawDelta::Stop { reason: "end_turn".into() },
        ]
    }

    #[tokio::test]
    async fn natural_completion_appends_answer() {
        let backend = Arc::new(MockBackend::new(vec![text_turn("Hi")]));
        let summary = driver(backend, 20, &[]).run().await;
        assert_eq!(summary.reason, DoneReason::Natural);
        assert_eq!(summary.history.len(), 2);
        assert_eq!(summary.history.last().unwrap().content, "Hi");
        assert_eq!(summary.iterations, 1);
    }

    #[tokio::test]
    async fn tool_round_trip_writes_history() {
        let backend = Arc::new(MockBackend::new(vec![tool_turn("1", "search"), text_turn("done")]));
        let summary = driver(backend.clone(), 20, &["search"]).run().await;

        assert_eq!(summary.reason, DoneReason::Natural);
        assert_eq!(summary.tool_call_count, 1);
        let roles: Vec<_> = summary.history.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(summary.history.messages[1].tool_calls.len(), 1);
        assert_eq!(summary.history.messages[2].content, "search:{}");
        assert_eq!(backend.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn tool_errors_are_recovered() {
        let backend = Arc::new(MockBackend::new(vec![
            vec![
                RawDelta::ToolCallStart { id: "1".into(), name: "fail".into(), index: None },
                RawDelta::ToolCallStart { id: "2".into(), name: "missing".into(), index: None },
                RawDelta::Stop { reason: "tool_use".into() },
            ],
            text_turn("recovered"),
        ]));
        let summary = driver(backend, 20, &["fail"]).run().await;

        assert_eq!(summary.reason, DoneReason::Natural);
        assert_eq!(summary.tool_call_count, 2);
        let results: Vec<_> = summary
            .history
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|m| m.is_error()));
        assert!(results[0].content.starts_with("Error: "));
        assert!(results[1].content.contains("not available"));

        let tool_blocks: Vec<_> = summary.blocks.iter().filter(|b| b.as_tool_call().is_some()).collect();
        assert!(tool_blocks.iter().all(|b| b.status == BlockStatus::Error));
    }

    #[tokio::test]
    async fn ceiling_checked_inside_a_turn() {
        let backend = Arc::new(MockBackend::new(vec![vec![
            RawDelta::ToolCallStart { id: "1".into(), name: "search".into(), index: None },
            RawDelta::ToolCallStart { id: "2".into(), name: "search".into(), index: None },
            RawDelta::ToolCallStart { id: "3".into(), name: "search".into(), index: None },
            RawDelta::Stop { reason: "tool_use".into() },
        ]]));
        let summary = driver(backend, 2, &["search"]).run().await;

        assert_eq!(summary.reason, DoneReason::Bounded);
        assert_eq!(summary.tool_call_count, 2);
        let last = summary.blocks.last().unwrap();
        assert_eq!(last.text(), Some(MAX_TOOL_CALLS_MARKER));
        assert!(summary.blocks.iter().all(|b| !b.is_loading()));
    }

    #[tokio::test]
    async fn backend_start_failure_is_fatal() {
        let backend = Arc::new(MockBackend::new(vec![]));
        let (tx, mut rx) = mpsc::channel(16);
        let summary = driver(backend, 20, &[]).with_events(tx).run().await;

        assert_eq!(summary.reason, DoneReason::Error);
        let mut types = vec![];
        while let Some(event) = rx.recv().await {
            types.push(event.event_type());
        }
        assert_eq!(types, vec!["error", "response", "end"]);
    }

    #[tokio::test]
    async fn panicking_tool_ends_with_error() {
        let backend = Arc::new(MockBackend::new(vec![tool_turn("1", "panic")]));
        let summary = driver(backend, 20, &["panic"]).run().await;
        assert_eq!(summary.reason, DoneReason::Error);
        assert!(summary
            .blocks
            .iter()
            .any(|b| b.text().is_some_and(|t| t.contains("tool exploded"))));
    }

    #[tokio::test]
    async fn usage_estimated_when_backend_reports_none() {
        let backend = Arc::new(MockBackend::new(vec![text_turn("Hello there")]));
        let summary = driver(backend, 20, &[]).run().await;
        assert!(summary.usage.total_tokens > 0);
    }

    #[tokio::test]
    async fn reported_usage_is_summed() {
        let backend = Arc::new(MockBackend::new(vec![
            vec![
                RawDelta::ToolCallStart { id: "1".into(), name: "search".into(), index: None },
                RawDelta::Usage { prompt_tokens: 10, completion_tokens: 2, total_tokens: 12 },
                RawDelta::Stop { reason: "tool_use".into() },
            ],
            vec![
                RawDelta::Text { text: "ok".into() },
                RawDelta::Usage { prompt_tokens: 20, completion_tokens: 3, total_tokens: 23 },
                RawDelta::Stop { reason: "end_turn".into() },
            ],
        ]));
        let summary = driver(backend, 20, &["search"]).run().await;
        assert_eq!(summary.usage, Usage::new(30, 5));
    }

    #[tokio::test]
    async fn inline_mode_injects_instructions_and_merges_responses() {
        let mut mock = MockBackend::new(vec![
            vec![
                RawDelta::Text {
                    text: "<tool_call>{\"name\":\"search\",\"arguments\":{\"q\":1}}</tool_call>\
                           <tool_call>{\"name\":\"search\",\"arguments\":{\"q\":2}}</tool_call>"
                        .into(),
                },
                RawDelta::Stop { reason: "stop".into() },
            ],
            text_turn("answer"),
        ]);
        mock.native = false;
        let backend = Arc::new(mock);
        let summary = driver(backend.clone(), 20, &["search"]).run().await;

        assert_eq!(summary.reason, DoneReason::Natural);
        assert_eq!(summary.tool_call_count, 2);
        let roles: Vec<_> = summary.history.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
        let merged = &summary.history.messages[2].content;
        assert_eq!(merged.matches("<tool_response").count(), 2);
        assert!(merged.contains(r#"search:{"q":1}"#));

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].messages[0].role, Role::System);
        assert!(requests[0].messages[0].content.contains("<tool_call>"));
        assert!(!requests[0].native_tools);
        // The instructions never leak into the session history.
        assert!(summary.history.messages.iter().all(|m| m.role != Role::System));
    }

    #[tokio::test]
    async fn cancelled_before_start_calls_nothing() {
        let backend = Arc::new(MockBackend::new(vec![text_turn("never")]));
        let d = driver(backend.clone(), 20, &[]);
        d.cancel.cancel();
        let summary = d.run().await;
        assert!(summary.cancelled());
        assert!(backend.requests.lock().unwrap().is_empty());
        assert_eq!(summary.blocks.last().unwrap().status, BlockStatus::Cancel);
    }
}
