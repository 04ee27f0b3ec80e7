//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Chorus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path. Conversation state lives under `<data_dir>/conversations`.
    pub data_dir: PathBuf,

    /// Optional directory for rolling log files.
    pub log_dir: Option<PathBuf>,

    pub bot: BotConfig,
    pub llm: LlmConfig,
    pub history: HistoryConfig,
    pub retrieval: RetrievalConfig,
    pub delivery: DeliveryConfig,
    pub extensions: ExtensionsConfig,
}

/// Bot persona settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub display_name: String,

    /// Sticky system turn placed ahead of every prompt.
    pub prime_directive: String,

    /// Top-level command name the bot registers.
    pub command_name: String,

    /// Permalink format. `{community}`, `{conversation}` and `{message}` are substituted.
    pub permalink_template: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            display_name: "Chorus".into(),
            prime_directive: "You are Chorus, a helpful participant in a group chat. \
                Answer concisely. When asked to produce a file, wrap it as \
                <file name=\"NAME\">CONTENT</file>."
                .into(),
            command_name: "chorus".into(),
            permalink_template: "https://discord.com/channels/{community}/{conversation}/{message}"
                .into(),
        }
    }
}

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// The provider's `/embeddings` endpoint.
    Remote,
    /// Local fastembed model.
    Local,
}

/// LLM provider configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible API base URL.
    pub base_url: String,

    /// API key (from file, or `CHORUS_API_KEY` / `OPENAI_API_KEY`).
    pub api_key: Option<String>,

    pub chat_model: String,
    pub vision_model: String,
    pub embedding_model: String,
    pub embedding_backend: EmbeddingBackend,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key: None,
            chat_model: "gpt-4o-mini".into(),
            vision_model: "gpt-4o-mini".into(),
            embedding_model: "text-embedding-3-small".into(),
            embedding_backend: EmbeddingBackend::Remote,
            max_tokens: 1024,
        }
    }
}

/// History window budget.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum cumulative characters kept in the history window.
    pub max_chars: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_chars: 12_000 }
    }
}

/// Retrieval tuning.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Default similarity threshold for new conversations.
    pub similarity_threshold: f32,

    /// Maximum number of text/factoid matches added to a prompt.
    pub match_limit: usize,

    /// Chunk size in characters for ingested text.
    pub chunk_chars: usize,

    /// Minimum message length before plain chat text is ingested.
    pub min_ingest_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.80,
            match_limit: 5,
            chunk_chars: 1_000,
            min_ingest_chars: 40,
        }
    }
}

/// Outbound delivery limits.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Maximum characters per platform message.
    pub max_message_chars: usize,

    /// Files larger than this are replaced with a warning.
    pub max_file_bytes: usize,

    /// Whether the platform accepts a file and caption in one message.
    pub inline_file_caption: bool,

    /// Delay between consecutive deliveries.
    pub pacing_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_message_chars: 2_000,
            max_file_bytes: 8 * 1024 * 1024,
            inline_file_caption: true,
            pacing_ms: 250,
        }
    }
}

/// Extension discovery settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ExtensionsConfig {
    /// Directory scanned once at boot for extension manifests.
    pub directory: Option<PathBuf>,

    /// Extension ids that are never activated.
    pub disabled: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            log_dir: None,
            bot: BotConfig::default(),
            llm: LlmConfig::default(),
            history: HistoryConfig::default(),
            retrieval: RetrievalConfig::default(),
            delivery: DeliveryConfig::default(),
            extensions: ExtensionsConfig::default(),
        }
    }
}

impl Config {
    /// Default data directory, under the platform data dir.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("chorus"))
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    /// Load configuration from the environment only.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML config file, then apply environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(source),
        })?;
        let mut config = Self::from_toml(&raw, path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn from_toml(raw: &str, path: &Path) -> Result<Self> {
        toml::from_str(raw).map_err(|error| {
            ConfigError::Parse {
                path: path.display().to_string(),
                message: error.to_string(),
            }
            .into()
        })
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("CHORUS_API_KEY").or_else(|_| std::env::var("OPENAI_API_KEY"))
            && !key.trim().is_empty()
        {
            self.llm.api_key = Some(key);
        }
        if let Ok(base_url) = std::env::var("CHORUS_BASE_URL") {
            self.llm.base_url = base_url;
        }
        if let Ok(data_dir) = std::env::var("CHORUS_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }
    }

    /// Reject configurations the process cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.llm.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            return Err(ConfigError::MissingKey(
                "llm.api_key (set CHORUS_API_KEY or OPENAI_API_KEY)".into(),
            )
            .into());
        }
        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "retrieval.similarity_threshold must be within 0..=1, got {}",
                self.retrieval.similarity_threshold
            ))
            .into());
        }
        if self.history.max_chars == 0 {
            return Err(ConfigError::Invalid("history.max_chars must be positive".into()).into());
        }
        if self.delivery.max_message_chars == 0 {
            return Err(
                ConfigError::Invalid("delivery.max_message_chars must be positive".into()).into(),
            );
        }
        if self.retrieval.chunk_chars == 0 {
            return Err(ConfigError::Invalid("retrieval.chunk_chars must be positive".into()).into());
        }
        Ok(())
    }

    /// Root of all per-conversation state directories.
    pub fn conversations_dir(&self) -> PathBuf {
        self.data_dir.join("conversations")
    }

    /// Render a permalink for a message.
    pub fn permalink(&self, community: &str, conversation: &str, message: &str) -> String {
        self.bot
            .permalink_template
            .replace("{community}", community)
            .replace("{conversation}", conversation)
            .replace("{message}", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn parses_partial_toml_with_defaults() {
        let raw = indoc! {r#"
            data_dir = "/tmp/chorus-test"

            [llm]
            api_key = "sk-test"
            chat_model = "local/llama"

            [retrieval]
            similarity_threshold = 0.7
        "#};

        let config = Config::from_toml(raw, Path::new("chorus.toml")).expect("valid toml");

        assert_eq!(config.data_dir, PathBuf::from("/tmp/chorus-test"));
        assert_eq!(config.llm.chat_model, "local/llama");
        assert_eq!(config.retrieval.similarity_threshold, 0.7);
        assert_eq!(config.retrieval.match_limit, 5);
        assert_eq!(config.delivery.max_message_chars, 2_000);
        config.validate().expect("config should validate");
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let config = Config::default();
        let error = config.validate().expect_err("no key must fail");
        assert!(error.to_string().contains("missing required config key"));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut config = Config::default();
        config.llm.api_key = Some("sk-test".into());
        config.retrieval.similarity_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn renders_permalink() {
        let config = Config::default();
        assert_eq!(
            config.permalink("1", "2", "3"),
            "https://discord.com/channels/1/2/3"
        );
    }
}
