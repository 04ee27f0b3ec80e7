//! Language-model service client.

pub mod manager;
pub mod model;

pub use manager::LlmManager;
pub use model::{ChatMessage, FragmentStream, LanguageModel, OpenAiModel, RemoteEmbedder};
