//! Model backend implementations for toolstream.
//!
//! All backends implement the `toolstream_core::ModelBackend` trait.
//! The router selects the correct backend from a model reference.

pub mod router;
pub mod scripted;

pub use router::BackendRouter;
pub use scripted::{ScriptedBackend, ScriptedFixture, ScriptedTurn};
