//! Conversation history window and prompt composition.

pub mod history;
pub mod prompt;

pub use history::{HistoryWindow, Role, Turn};
pub use prompt::{PromptInputs, compose};
