//! Chorus CLI entry point.

use anyhow::Context as _;
use chorus::agent::ConversationEngine;
use chorus::config::{Config, EmbeddingBackend};
use chorus::extensions::traits::Services;
use chorus::extensions::{ExtensionPipeline, ExtensionRegistry};
use chorus::llm::{LlmManager, OpenAiModel, RemoteEmbedder};
use chorus::memory::embedding::{Embedder, LocalEmbedder};
use chorus::memory::ingest::HttpAttachmentSource;
use chorus::messaging::{JsonLinesAdapter, MessagingDyn};
use chorus::state::{StateDefaults, StateStore};

use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Parser)]
#[command(name = "chorus")]
#[command(about = "A conversational agent for group chats, speaking JSON lines on stdio")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Configuration errors are the only fatal ones, so they come first.
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::load().with_context(|| "failed to load configuration from environment")?
    };

    let _log_guard = init_logging(&config, cli.debug);
    tracing::info!(data_dir = %config.data_dir.display(), "configuration loaded");

    let config = Arc::new(config);

    let llm_manager = Arc::new(
        LlmManager::new(config.llm.clone()).with_context(|| "failed to initialize LLM manager")?,
    );
    let embedder: Arc<dyn Embedder> = match config.llm.embedding_backend {
        EmbeddingBackend::Remote => Arc::new(RemoteEmbedder::new(llm_manager.clone())),
        EmbeddingBackend::Local => Arc::new(
            LocalEmbedder::new().with_context(|| "failed to initialize local embedding model")?,
        ),
    };
    let model = Arc::new(OpenAiModel::new(llm_manager.clone()));
    let attachments = Arc::new(HttpAttachmentSource::new(
        llm_manager.http_client().clone(),
        config.delivery.max_file_bytes,
    ));

    let store = Arc::new(StateStore::new(
        config.conversations_dir(),
        StateDefaults {
            history_max_chars: config.history.max_chars,
            similarity_threshold: config.retrieval.similarity_threshold,
        },
    ));
    let report = store
        .load()
        .await
        .with_context(|| "failed to scan persisted conversation state")?;
    tracing::info!(?report, "conversation state loaded");

    let mut registry = ExtensionRegistry::with_builtins();
    if let Some(dir) = &config.extensions.directory {
        registry
            .discover(dir)
            .await
            .with_context(|| format!("failed to scan extension directory {}", dir.display()))?;
    }
    let resolved = registry.resolve(&config.extensions.disabled);
    for (id, reason) in &resolved.excluded {
        tracing::warn!(extension = %id, %reason, "extension excluded");
    }
    let pipeline = Arc::new(ExtensionPipeline::new(resolved.active, &config));

    let messaging: Arc<dyn MessagingDyn> = Arc::new(JsonLinesAdapter::stdio());
    let services = Services {
        config: config.clone(),
        embedder,
    };

    let engine = Arc::new(ConversationEngine::new(
        config.clone(),
        store,
        pipeline,
        services,
        model,
        attachments,
        messaging.clone(),
    ));
    engine.start().await;

    let events = messaging
        .start()
        .await
        .with_context(|| "failed to start messaging adapter")?;

    tracing::info!("chorus started");

    engine
        .run(events, async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    if let Err(error) = messaging.shutdown().await {
        tracing::warn!(%error, "messaging adapter shutdown failed");
    }
    tracing::info!("chorus stopped");
    Ok(())
}

/// Log to stderr (stdout carries the protocol), plus a daily-rotated file when
/// `log_dir` is set. The returned guard flushes the file writer on drop.
fn init_logging(config: &Config, debug: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chorus.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                ),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}
