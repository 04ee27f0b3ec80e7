//! Embedding generation and vector similarity.

use crate::error::{LlmError, Result};

use std::sync::Arc;

/// Text in, fixed-length vector out.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Local embedding model via fastembed (all-MiniLM-L6-v2 by default).
pub struct LocalEmbedder {
    model: Arc<fastembed::TextEmbedding>,
}

impl LocalEmbedder {
    pub fn new() -> Result<Self> {
        let model = fastembed::TextEmbedding::try_new(Default::default())
            .map_err(|e| LlmError::EmbeddingFailed(e.to_string()))?;

        Ok(Self {
            model: Arc::new(model),
        })
    }
}

#[async_trait::async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        // fastembed is synchronous, run it off the async workers
        let model = self.model.clone();
        let text = text.to_string();
        let embeddings = tokio::task::spawn_blocking(move || model.embed(vec![text], None))
            .await
            .map_err(|e| crate::Error::Other(anyhow::anyhow!("embedding task failed: {e}")))?
            .map_err(|e| LlmError::EmbeddingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::EmbeddingFailed("model returned no embedding".into()).into())
    }
}

/// Cosine similarity of two vectors.
///
/// Mismatched dimensions and zero-norm vectors score 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
