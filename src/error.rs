//! Top-level error types for Chorus.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors. These are the only fatal errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),
}

/// Conversation state and persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(
        "conversation {conversation_id} is bound to community {bound}, refusing community {offered}"
    )]
    IdentityConflict {
        conversation_id: String,
        bound: String,
        offered: String,
    },

    #[error("artifact {path} rejected: {reason}")]
    ArtifactRejected { path: String, reason: String },

    #[error("conversation {conversation_id} has no bound identity")]
    Unbound { conversation_id: String },

    #[error("failed to persist {path}: {message}")]
    SaveFailed { path: String, message: String },
}

/// LLM provider errors. Surfaced as failed turns, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider request failed: {0}")]
    ProviderRequest(String),

    #[error("provider returned {status}: {message}")]
    ProviderStatus { status: u16, message: String },

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("completion failed: {0}")]
    CompletionFailed(String),
}

/// Retrieval and learning errors.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("failed to download attachment {filename}: {message}")]
    DownloadFailed { filename: String, message: String },

    #[error("failed to store attachment {filename}: {message}")]
    StoreFailed { filename: String, message: String },

    #[error("template rendering failed: {0}")]
    Template(String),
}

/// Extension module errors. Always isolated to the module that raised them.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("extension {id} failed in {hook}: {message}")]
    HookFailed {
        id: String,
        hook: &'static str,
        message: String,
    },

    #[error("extension {id} panicked in {hook}")]
    Panicked { id: String, hook: &'static str },

    #[error("unknown extension kind {kind} in manifest {path}")]
    UnknownKind { kind: String, path: String },

    #[error("invalid extension manifest {path}: {message}")]
    InvalidManifest { path: String, message: String },

    #[error("extension {id} settings invalid: {message}")]
    InvalidSettings { id: String, message: String },
}

/// Outbound delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("platform send failed: {0}")]
    SendFailed(String),

    #[error("failed to read reattached file {path}: {message}")]
    ReadFailed { path: String, message: String },
}
