//! Retrievable content: chunks, documents, factoids and their provenance.

use crate::CommunityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Where a piece of content came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provenance {
    pub community_id: String,
    pub conversation_id: String,
    pub message_id: String,
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
}

/// Image linkage carried by an image chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageLink {
    /// Stored file path on disk.
    pub path: PathBuf,
    /// Original attachment filename.
    pub filename: String,
    pub mime_type: String,
    /// Generated description, or the ingestion placeholder until regenerated.
    pub description: String,
}

/// A bounded-size slice of source text paired with its embedding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub image: Option<ImageLink>,
    pub provenance: Provenance,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Chunk {
    pub fn new(text: impl Into<String>, embedding: Vec<f32>, provenance: Provenance) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            embedding,
            image: None,
            provenance,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn with_image(mut self, image: ImageLink) -> Self {
        self.image = Some(image);
        self
    }

    pub fn is_image(&self) -> bool {
        self.image.is_some()
    }
}

/// A set of chunks persisted together, keyed by their source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub key: String,
    /// Embedded identity, validated against the conversation on load.
    pub community_id: Option<CommunityId>,
    pub chunks: Vec<Chunk>,
}

impl Document {
    pub fn new(key: impl Into<String>, community_id: Option<CommunityId>) -> Self {
        Self {
            key: key.into(),
            community_id,
            chunks: Vec::new(),
        }
    }
}

/// Who supplied a factoid, and where.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FactoidProvenance {
    pub supplier_id: String,
    pub supplier_name: String,
    pub community_id: String,
    pub conversation_id: String,
    pub message_id: String,
}

/// A learned term-to-fact association.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Factoid {
    /// Normalized lookup term.
    pub term: String,
    pub fact: String,
    pub embedding: Vec<f32>,
    pub provenance: FactoidProvenance,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// One line of the factoid match log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchLogEntry {
    pub term: String,
    pub requester_id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub matched_at: chrono::DateTime<chrono::Utc>,
}

/// Running factoid match statistics for a conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchStats {
    /// Embedded identity, validated against the conversation on load.
    #[serde(default)]
    pub community_id: Option<CommunityId>,
    pub total_matches: u64,
    pub per_term: BTreeMap<String, u64>,
    pub last_match_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl MatchStats {
    pub fn record(&mut self, entry: &MatchLogEntry) {
        self.total_matches += 1;
        *self.per_term.entry(entry.term.clone()).or_insert(0) += 1;
        self.last_match_at = Some(entry.matched_at);
    }
}

/// Anything that carries an embedding can be ranked.
pub trait Embedded {
    fn embedding(&self) -> &[f32];
}

impl Embedded for Chunk {
    fn embedding(&self) -> &[f32] {
        &self.embedding
    }
}

impl Embedded for Factoid {
    fn embedding(&self) -> &[f32] {
        &self.embedding
    }
}

/// A ranked match with its similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMatch<T> {
    pub item: T,
    pub score: f32,
}
