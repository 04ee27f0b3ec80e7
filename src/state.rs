//! Conversation state: identity, options, history and retrievable content.

pub mod identity;
pub mod layout;
pub mod store;
pub mod types;

pub use identity::IdentityRegistry;
pub use store::{ConversationHandle, LoadReport, StateStore};
pub use types::{ConversationState, Identity, Options, StateDefaults};
