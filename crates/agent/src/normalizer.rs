//! Stream event normalizer — raw backend deltas in, canonical events out.
//!
//! Tool-call argument fragments are buffered per call until the call is
//! closed. Calls still open when the turn stops are flushed with whatever
//! fragments arrived, since some backends never send an end marker. For
//! models without structured tool calling, calls are recovered from the
//! turn's text at stop time (see [`crate::inline`]).

use std::collections::{HashMap, VecDeque};

use toolstream_core::backend::{DeltaReceiver, RawDelta, Usage};
use toolstream_core::error::BackendError;
use toolstream_core::stream::{CanonicalEvent, ResolvedToolCall, StopReason};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::inline;

/// A tool call whose arguments are still streaming.
#[derive(Debug)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Per-turn normalization state.
#[derive(Debug)]
pub struct StreamEventNormalizer {
    native_tools: bool,
    pending: Vec<PendingToolCall>,
    index_ids: HashMap<u32, String>,
    resolved: Vec<ResolvedToolCall>,
    text: String,
    reasoning: String,
    finished: bool,
}

impl StreamEventNormalizer {
    pub fn new(native_tools: bool) -> Self {
        Self {
            native_tools,
            pending: Vec::new(),
            index_ids: HashMap::new(),
            resolved: Vec::new(),
            text: String::new(),
            reasoning: String::new(),
            finished: false,
        }
    }

    /// Whether a terminal `Stop` has been emitted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Tool calls resolved so far this turn, in resolution order.
    pub fn resolved_tool_calls(&self) -> &[ResolvedToolCall] {
        &self.resolved
    }

    /// Move the resolved tool calls out.
    pub fn take_tool_calls(&mut self) -> Vec<ResolvedToolCall> {
        std::mem::take(&mut self.resolved)
    }

    /// Visible text of the turn so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Reasoning text of the turn so far.
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Everything the model generated this turn, for token estimation.
    pub fn completion_text(&self) -> String {
        let mut out = String::with_capacity(self.text.len() + self.reasoning.len());
        out.push_str(&self.reasoning);
        out.push_str(&self.text);
        for call in &self.resolved {
            out.push_str(&call.name);
            out.push_str(&call.arguments);
        }
        out
    }

    /// Normalize one raw delta.
    pub fn push(&mut self, delta: RawDelta) -> Vec<CanonicalEvent> {
        if self.finished {
            trace!(?delta, "Ignoring delta after stop");
            return Vec::new();
        }

        match delta {
            RawDelta::Text { text } => {
                if text.is_empty() {
                    return Vec::new();
                }
                self.text.push_str(&text);
                vec![CanonicalEvent::Text { content: text }]
            }
            RawDelta::Reasoning { text } => {
                if text.is_empty() {
                    return Vec::new();
                }
                self.reasoning.push_str(&text);
                vec![CanonicalEvent::Reasoning { content: text }]
            }
            RawDelta::ToolCallStart { id, name, index } => self.start_call(id, name, index),
            RawDelta::ToolCallArgs { id, index, fragment } => self.append_args(id, index, fragment),
            RawDelta::ToolCallEnd { id, arguments } => self.end_call(&id, arguments),
            RawDelta::Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens,
            } => vec![CanonicalEvent::Usage(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens,
            })],
            RawDelta::Image { mime_type, data } => vec![CanonicalEvent::ImageData { mime_type, data }],
            RawDelta::Stop { reason } => self.stop(StopReason::from_vendor(&reason)),
            RawDelta::Error { message } => self.error(message),
        }
    }

    /// The backend transport failed.
    pub fn fail(&mut self, error: &BackendError) -> Vec<CanonicalEvent> {
        if self.finished {
            return Vec::new();
        }
        self.error(error.to_string())
    }

    /// The raw stream closed. Without an explicit stop this is a normal completion.
    pub fn finish(&mut self) -> Vec<CanonicalEvent> {
        if self.finished {
            return Vec::new();
        }
        debug!("Raw stream ended without a stop delta");
        self.stop(StopReason::Complete)
    }

    fn start_call(&mut self, id: String, name: String, index: Option<u32>) -> Vec<CanonicalEvent> {
        if self.pending.iter().any(|p| p.id == id) {
            trace!(id = %id, "Duplicate tool call start");
            return Vec::new();
        }
        if let Some(index) = index {
            self.index_ids.insert(index, id.clone());
        }
        self.pending.push(PendingToolCall {
            id: id.clone(),
            name: name.clone(),
            arguments: String::new(),
        });
        vec![CanonicalEvent::ToolCallStart { id, name }]
    }

    fn append_args(&mut self, id: Option<String>, index: Option<u32>, fragment: String) -> Vec<CanonicalEvent> {
        let key = id
            .or_else(|| index.and_then(|i| self.index_ids.get(&i).cloned()))
            .or_else(|| self.pending.last().map(|p| p.id.clone()));

        let Some(key) = key else {
            trace!(fragment = %fragment, "Dropping argument fragment with no open tool call");
            return Vec::new();
        };

        match self.pending.iter_mut().find(|p| p.id == key) {
            Some(call) => {
                call.arguments.push_str(&fragment);
                vec![CanonicalEvent::ToolCallChunk { id: key, fragment }]
            }
            None => {
                trace!(id = %key, "Dropping argument fragment for unknown tool call");
                Vec::new()
            }
        }
    }

    fn end_call(&mut self, id: &str, arguments: Option<String>) -> Vec<CanonicalEvent> {
        let Some(pos) = self.pending.iter().position(|p| p.id == id) else {
            trace!(id = %id, "Tool call end without a start");
            return Vec::new();
        };
        let call = self.pending.remove(pos);
        let complete = arguments.filter(|a| !a.trim().is_empty());
        vec![self.resolve(call, complete)]
    }

    fn resolve(&mut self, call: PendingToolCall, complete: Option<String>) -> CanonicalEvent {
        let arguments = complete.or_else(|| {
            if call.arguments.trim().is_empty() {
                None
            } else {
                Some(call.arguments)
            }
        });
        self.resolved.push(ResolvedToolCall {
            id: call.id.clone(),
            name: call.name,
            arguments: arguments.clone().unwrap_or_else(|| "{}".to_string()),
        });
        CanonicalEvent::ToolCallEnd {
            id: call.id,
            arguments,
        }
    }

    fn stop(&mut self, reason: StopReason) -> Vec<CanonicalEvent> {
        let mut events = Vec::new();

        // Flush calls the backend never closed.
        for call in std::mem::take(&mut self.pending) {
            debug!(id = %call.id, name = %call.name, "Flushing unterminated tool call at stop");
            events.push(self.resolve(call, None));
        }

        if !self.native_tools && reason != StopReason::Error {
            for call in inline::parse_tool_calls(&self.text) {
                let id = format!("call_{}", Uuid::new_v4().simple());
                events.push(CanonicalEvent::ToolCallStart {
                    id: id.clone(),
                    name: call.name.clone(),
                });
                events.push(CanonicalEvent::ToolCallEnd {
                    id: id.clone(),
                    arguments: Some(call.arguments.clone()),
                });
                self.resolved.push(ResolvedToolCall {
                    id,
                    name: call.name,
                    arguments: call.arguments,
                });
            }
        }

        let reason = if reason == StopReason::Complete && !self.resolved.is_empty() {
            StopReason::ToolUse
        } else {
            reason
        };

        self.finished = true;
        events.push(CanonicalEvent::Stop { reason });
        events
    }

    fn error(&mut self, message: String) -> Vec<CanonicalEvent> {
        self.pending.clear();
        self.finished = true;
        vec![
            CanonicalEvent::Error { message },
            CanonicalEvent::Stop {
                reason: StopReason::Error,
            },
        ]
    }
}

/// A backend delta channel viewed as a sequence of canonical events.
pub struct NormalizedStream {
    rx: DeltaReceiver,
    normalizer: StreamEventNormalizer,
    queue: VecDeque<CanonicalEvent>,
}

impl NormalizedStream {
    pub fn new(rx: DeltaReceiver, native_tools: bool) -> Self {
        Self {
            rx,
            normalizer: StreamEventNormalizer::new(native_tools),
            queue: VecDeque::new(),
        }
    }

    /// Next canonical event; `None` once the terminal `Stop` has been returned.
    ///
    /// Cancel-safe: dropping the future between events loses nothing.
    pub async fn next(&mut self) -> Option<CanonicalEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }
            if self.normalizer.is_finished() {
                return None;
            }
            let events = match self.rx.recv().await {
                Some(Ok(delta)) => self.normalizer.push(delta),
                Some(Err(e)) => self.normalizer.fail(&e),
                None => self.normalizer.finish(),
            };
            self.queue.extend(events);
        }
    }

    pub fn normalizer(&self) -> &StreamEventNormalizer {
        &self.normalizer
    }

    pub fn normalizer_mut(&mut self) -> &mut StreamEventNormalizer {
        &mut self.normalizer
    }
}

/// Normalize a complete, already-recorded delta sequence.
pub fn normalize_all<I>(deltas: I, native_tools: bool) -> (Vec<CanonicalEvent>, Vec<ResolvedToolCall>)
where
    I: IntoIterator<Item = RawDelta>,
{
    let mut normalizer = StreamEventNormalizer::new(native_tools);
    let mut events = Vec::new();
    for delta in deltas {
        events.extend(normalizer.push(delta));
        if normalizer.is_finished() {
            break;
        }
    }
    events.extend(normalizer.finish());
    let calls = normalizer.take_tool_calls();
    (events, calls)
}
