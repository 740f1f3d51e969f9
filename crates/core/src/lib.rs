//! # toolstream core
//!
//! Domain types, collaborator traits, and error definitions for the
//! toolstream agent orchestrator. This crate performs no I/O — it defines
//! the model that the normalizer, accumulator, driver and registry in
//! `toolstream-agent` are written against.
//!
//! ## Collaborators
//!
//! The orchestrator talks to the outside world through three traits:
//! - [`ModelBackend`] streams raw deltas for a conversation
//! - [`ToolExecutor`] runs a tool call on the server that hosts it
//! - [`ConsumerBridge`] receives events and block snapshots for persistence and UI

pub mod backend;
pub mod block;
pub mod bridge;
pub mod error;
pub mod message;
pub mod session;
pub mod stream;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use backend::{BackendRequest, DeltaReceiver, ModelBackend, ModelRef, RawDelta, ToolDefinition, Usage};
pub use block::{BlockKind, BlockStatus, ContentBlock, ToolCallBlock};
pub use bridge::{BridgeNotification, BroadcastBridge, ConsumerBridge, NoopBridge};
pub use error::{AdmissionError, BackendError, Error, Result, ToolError};
pub use message::{Conversation, Message, MessageToolCall, Role, SessionId};
pub use session::{DoneReason, SessionMetrics, SessionSummary};
pub use stream::{CanonicalEvent, ResolvedToolCall, StopReason};
pub use tool::{CatalogEntry, Tool, ToolCatalog, ToolContent, ToolExecutor, ToolOutput, ToolRegistry, ToolServer};
