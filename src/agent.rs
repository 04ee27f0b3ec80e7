//! The conversation engine: per-event control flow and scheduling.

pub mod conversation;

pub use conversation::{ConversationEngine, TurnOutcome};
