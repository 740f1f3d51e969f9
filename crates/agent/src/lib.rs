//! The streaming agent loop — the heart of toolstream.
//!
//! Each session runs an **Await → Stream → Decide → Execute** cycle:
//!
//! 1. **Stream** a model turn from the [`ModelBackend`](toolstream_core::ModelBackend)
//! 2. **Normalize** raw deltas into canonical events ([`StreamEventNormalizer`])
//! 3. **Accumulate** them into renderable content blocks ([`ConversationAccumulator`])
//! 4. **If tool calls**: execute them in order, rewrite history, loop back to 1
//! 5. **Otherwise**: finish, report usage, and send `end`
//!
//! The [`StreamSessionRegistry`] runs many sessions at once under a
//! concurrency cap and exposes cooperative cancellation.

pub mod accumulator;
pub mod driver;
pub mod inline;
pub mod normalizer;
pub mod registry;
pub mod stream_event;
pub mod token;

pub use accumulator::ConversationAccumulator;
pub use driver::{AgentLoopDriver, DriverContext, LoopState, MAX_TOOL_CALLS_MARKER, SessionRequest};
pub use normalizer::{NormalizedStream, StreamEventNormalizer, normalize_all};
pub use registry::{SessionGuard, StreamSessionRegistry};
pub use stream_event::SessionEvent;
