//! Chat platform adapters.

pub mod stdio;
pub mod traits;

pub use stdio::JsonLinesAdapter;
pub use traits::{InboundStream, Messaging, MessagingDyn};
