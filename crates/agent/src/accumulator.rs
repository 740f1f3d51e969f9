//! Conversation accumulator — folds canonical events into the content-block
//! list of the assistant message under construction.
//!
//! Pure state: no I/O, no clocks beyond `Utc::now()` for block timestamps.
//!
//! Streamed blocks (`content`, `reasoning`) stay `loading` while they grow
//! and are finalized to `success` when the next block is appended. A
//! `tool_call` block is different: it stays `loading` until the driver
//! records the call's result, and leaves that state exactly once. When a
//! turn requests several calls, each of their blocks is `loading` until its
//! own result lands, so the one-loading-block rule covers streamed blocks.

use chrono::{DateTime, Utc};
use toolstream_core::backend::Usage;
use toolstream_core::block::{BlockKind, BlockStatus, ContentBlock, ToolCallBlock};
use toolstream_core::session::SessionMetrics;
use toolstream_core::stream::{CanonicalEvent, ResolvedToolCall};
use toolstream_core::tool::{ToolOutput, ToolServer};

const CANCELLED_TEXT: &str = "Generation cancelled";

/// Builds the block list, usage totals and latency window for one session.
#[derive(Debug, Clone)]
pub struct ConversationAccumulator {
    blocks: Vec<ContentBlock>,
    usage: Usage,
    started_at: DateTime<Utc>,
    first_output_at: Option<DateTime<Utc>>,
    reasoning_start: Option<DateTime<Utc>>,
    reasoning_end: Option<DateTime<Utc>>,
}

impl Default for ConversationAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationAccumulator {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            usage: Usage::default(),
            started_at: Utc::now(),
            first_output_at: None,
            reasoning_start: None,
            reasoning_end: None,
        }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<ContentBlock> {
        self.blocks
    }

    /// Usage summed over every `Usage` event applied so far.
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// Add usage that did not arrive as an event (e.g. an estimate).
    pub fn add_usage(&mut self, usage: &Usage) {
        self.usage.accumulate(usage);
    }

    /// Apply one canonical event. Returns true when the block list changed.
    pub fn apply(&mut self, event: &CanonicalEvent) -> bool {
        if event.is_output() && self.first_output_at.is_none() {
            self.first_output_at = Some(Utc::now());
        }

        match event {
            CanonicalEvent::Text { content } => {
                if let Some(BlockKind::Content { content: existing }) = self.loading_streamed_kind() {
                    existing.push_str(content);
                } else {
                    self.append(
                        BlockKind::Content { content: content.clone() },
                        BlockStatus::Loading,
                    );
                }
                true
            }
            CanonicalEvent::Reasoning { content } => {
                let now = Utc::now();
                self.reasoning_start.get_or_insert(now);
                self.reasoning_end = Some(now);

                if let Some(BlockKind::Reasoning { content: existing }) = self.loading_streamed_kind() {
                    existing.push_str(content);
                } else {
                    self.append(
                        BlockKind::Reasoning { content: content.clone() },
                        BlockStatus::Loading,
                    );
                }
                true
            }
            CanonicalEvent::ToolCallStart { id, name } => {
                self.append(
                    BlockKind::ToolCall(ToolCallBlock {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: String::new(),
                        server: None,
                        response: None,
                    }),
                    BlockStatus::Loading,
                );
                true
            }
            CanonicalEvent::ImageData { mime_type, data } => {
                self.append(
                    BlockKind::Image {
                        mime_type: mime_type.clone(),
                        data: data.clone(),
                    },
                    BlockStatus::Success,
                );
                true
            }
            CanonicalEvent::Error { message } => {
                self.append(BlockKind::Error { message: message.clone() }, BlockStatus::Error);
                true
            }
            CanonicalEvent::Usage(usage) => {
                self.usage.accumulate(usage);
                false
            }
            // Argument assembly happens in the normalizer; the resolved call
            // reaches the block through `record_tool_result`.
            CanonicalEvent::ToolCallChunk { .. }
            | CanonicalEvent::ToolCallEnd { .. }
            | CanonicalEvent::Stop { .. } => false,
        }
    }

    /// Record the outcome of an executed (or rejected) tool call.
    ///
    /// Fills in the most recent block with the call's id and moves it to
    /// `success` or `error`. A call with no block yet gets one appended.
    /// Returns false when that block already carries a result.
    pub fn record_tool_result(
        &mut self,
        call: &ResolvedToolCall,
        server: Option<&ToolServer>,
        output: ToolOutput,
    ) -> bool {
        let status = if output.is_error {
            BlockStatus::Error
        } else {
            BlockStatus::Success
        };

        let position = self
            .blocks
            .iter()
            .rposition(|b| b.as_tool_call().is_some_and(|tc| tc.id == call.id));

        match position {
            Some(i) => {
                let block = &mut self.blocks[i];
                let BlockKind::ToolCall(tc) = &mut block.kind else {
                    return false;
                };
                if tc.response.is_some() {
                    return false;
                }
                tc.arguments = call.arguments.clone();
                tc.server = server.cloned();
                tc.response = Some(output);
                block.status = status;
                true
            }
            None => {
                self.append(
                    BlockKind::ToolCall(ToolCallBlock {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                        server: server.cloned(),
                        response: Some(output),
                    }),
                    status,
                );
                true
            }
        }
    }

    /// Append a finished `action` block, e.g. a loop-termination marker.
    pub fn push_marker(&mut self, text: impl Into<String>) {
        self.append(BlockKind::Action { content: text.into() }, BlockStatus::Success);
    }

    /// Mark every tool call still waiting for a result with `status`.
    pub fn abandon_pending_tools(&mut self, status: BlockStatus) -> bool {
        let mut changed = false;
        for block in &mut self.blocks {
            if let BlockKind::ToolCall(tc) = &block.kind {
                if tc.response.is_none() && block.status == BlockStatus::Loading {
                    block.status = status;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Finalize for a cancelled session: streamed blocks succeed, unexecuted
    /// tool calls are cancelled, and a single `cancel` block is appended.
    pub fn cancel(&mut self) {
        self.finalize_streamed();
        self.abandon_pending_tools(BlockStatus::Cancel);
        if !self.blocks.iter().any(|b| b.status == BlockStatus::Cancel && matches!(b.kind, BlockKind::Action { .. })) {
            self.blocks.push(ContentBlock::new(
                BlockKind::Action {
                    content: CANCELLED_TEXT.to_string(),
                },
                BlockStatus::Cancel,
            ));
        }
    }

    /// Finalize for any other ending: nothing is left `loading`.
    pub fn finish(&mut self) {
        self.finalize_streamed();
        self.abandon_pending_tools(BlockStatus::Error);
    }

    /// Latency metadata as of `now`.
    pub fn metrics(&self, now: DateTime<Utc>) -> SessionMetrics {
        let first_token_ms = self
            .first_output_at
            .map(|t| (t - self.started_at).num_milliseconds());
        let reasoning_ms = match (self.reasoning_start, self.reasoning_end) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };
        SessionMetrics {
            started_at: self.started_at,
            first_token_ms,
            reasoning_ms,
            total_ms: (now - self.started_at).num_milliseconds(),
        }
    }

    /// The kind of the last block, if it is a streamed block still loading.
    fn loading_streamed_kind(&mut self) -> Option<&mut BlockKind> {
        let last = self.blocks.last_mut()?;
        if last.status != BlockStatus::Loading {
            return None;
        }
        match last.kind {
            BlockKind::Content { .. } | BlockKind::Reasoning { .. } => Some(&mut last.kind),
            _ => None,
        }
    }

    fn append(&mut self, kind: BlockKind, status: BlockStatus) {
        self.finalize_streamed();
        self.blocks.push(ContentBlock::new(kind, status));
    }

    fn finalize_streamed(&mut self) {
        for block in &mut self.blocks {
            if block.status == BlockStatus::Loading && block.as_tool_call().is_none() {
                block.status = BlockStatus::Success;
            }
        }
    }
}
