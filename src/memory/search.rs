//! Similarity ranking over stored chunks and factoids.

use crate::memory::embedding::cosine_similarity;
use crate::memory::types::{Chunk, Embedded, Factoid, ScoredMatch};
use crate::state::types::ConversationState;

/// Ranking parameters for one retrieval pass.
#[derive(Debug, Clone, Copy)]
pub struct SearchConfig {
    /// Minimum cosine similarity for a candidate to be kept.
    pub threshold: f32,
    /// Maximum number of results.
    pub limit: usize,
}

/// Score every candidate against the query, keep those at or above the
/// threshold, order by descending similarity and truncate to the limit.
///
/// Ties keep candidate order.
pub fn rank<'a, T, I>(query: &[f32], candidates: I, config: SearchConfig) -> Vec<ScoredMatch<&'a T>>
where
    T: Embedded + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut scored: Vec<ScoredMatch<&'a T>> = candidates
        .into_iter()
        .map(|item| ScoredMatch {
            score: cosine_similarity(query, item.embedding()),
            item,
        })
        .filter(|m| m.score >= config.threshold)
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(config.limit);
    scored
}

/// What general retrieval found for one turn.
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    pub chunks: Vec<ScoredMatch<Chunk>>,
    pub factoids: Vec<ScoredMatch<Factoid>>,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.factoids.is_empty()
    }
}

/// Rank the conversation's text chunks and factoids against a query embedding.
///
/// `exclude_message` keeps the live turn's own freshly ingested chunks out of
/// its context. Image chunks are selected separately.
pub fn retrieve(
    state: &ConversationState,
    query: &[f32],
    limit: usize,
    exclude_message: Option<&str>,
) -> RetrievedContext {
    let config = SearchConfig {
        threshold: state.options.similarity_threshold,
        limit,
    };

    let chunks = rank(
        query,
        state
            .text_chunks()
            .filter(|c| Some(c.provenance.message_id.as_str()) != exclude_message),
        config,
    )
    .into_iter()
    .map(|m| ScoredMatch {
        item: m.item.clone(),
        score: m.score,
    })
    .collect();

    let factoids = rank(query, state.factoids.values(), config)
        .into_iter()
        .map(|m| ScoredMatch {
            item: m.item.clone(),
            score: m.score,
        })
        .collect();

    tracing::debug!(
        conversation_id = %state.conversation_id(),
        threshold = config.threshold,
        "retrieval complete"
    );

    RetrievedContext { chunks, factoids }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{Document, Provenance};
    use crate::state::types::StateDefaults;
    use std::sync::Arc;

    /// A unit vector whose cosine against `[1, 0]` is exactly `similarity`.
    fn at_similarity(similarity: f32) -> Vec<f32> {
        vec![similarity, (1.0 - similarity * similarity).sqrt()]
    }

    fn chunk(text: &str, similarity: f32) -> Chunk {
        Chunk::new(
            text,
            at_similarity(similarity),
            Provenance {
                community_id: "1".into(),
                conversation_id: "2".into(),
                message_id: format!("m-{text}"),
                attachment_id: None,
                author_id: None,
                author_name: None,
            },
        )
    }

    #[test]
    fn keeps_threshold_orders_and_truncates() {
        let chunks = vec![
            chunk("low", 0.50),
            chunk("edge", 0.80),
            chunk("best", 0.99),
            chunk("good", 0.90),
            chunk("fine", 0.85),
        ];

        let results = rank(
            &[1.0, 0.0],
            &chunks,
            SearchConfig {
                threshold: 0.80,
                limit: 3,
            },
        );

        let texts: Vec<&str> = results.iter().map(|m| m.item.text.as_str()).collect();
        assert_eq!(texts, vec!["best", "good", "fine"]);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn threshold_is_inclusive() {
        let chunks = vec![chunk("edge", 0.80), chunk("below", 0.79)];
        let results = rank(
            &[1.0, 0.0],
            &chunks,
            SearchConfig {
                threshold: 0.80 - 1e-6,
                limit: 10,
            },
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].item.text, "edge");
    }

    #[test]
    fn score_equal_to_threshold_is_kept() {
        let query = [1.0, 0.0];
        let edge = chunk("edge", 0.80);
        let below = chunk("below", 0.79);
        let exact = cosine_similarity(&query, &edge.embedding);

        let chunks = vec![edge, below];
        let results = rank(
            &query,
            &chunks,
            SearchConfig {
                threshold: exact,
                limit: 10,
            },
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, exact);
        assert_eq!(results[0].item.text, "edge");
    }

    #[test]
    fn retrieve_skips_live_turn() {
        let mut state = ConversationState::new(
            Arc::from("2"),
            StateDefaults {
                history_max_chars: 100,
                similarity_threshold: 0.8,
            },
        );
        let mut document = Document::new("docs", None);
        document.chunks.push(chunk("older", 0.95));
        document.chunks.push(chunk("live", 0.97));
        state.put_document(document);

        let context = retrieve(&state, &[1.0, 0.0], 5, Some("m-live"));
        assert_eq!(context.chunks.len(), 1);
        assert_eq!(context.chunks[0].item.text, "older");
        assert!(context.factoids.is_empty());
    }
}
