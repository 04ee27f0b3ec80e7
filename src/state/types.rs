//! Per-conversation state.

use crate::conversation::history::{HistoryWindow, Turn};
use crate::error::StateError;
use crate::memory::types::{Chunk, Document, Factoid, MatchStats};
use crate::state::layout::community_token;
use crate::{CommunityId, ConversationId, ConversationRef};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Conversation identity. The community binding is set once and never rebinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub community_id: Option<CommunityId>,
    pub community_name: String,
    pub conversation_id: ConversationId,
    pub conversation_name: String,
}

impl Identity {
    pub fn unbound(conversation_id: ConversationId) -> Self {
        Self {
            community_id: None,
            community_name: String::new(),
            conversation_id,
            conversation_name: String::new(),
        }
    }

    /// Bind to a community, or verify an existing binding.
    ///
    /// Display names are refreshed on every successful call; the community id
    /// itself never changes once set.
    pub fn bind(&mut self, conversation: &ConversationRef) -> Result<(), StateError> {
        match &self.community_id {
            Some(bound) if community_token(bound) != community_token(&conversation.community_id) => {
                return Err(StateError::IdentityConflict {
                    conversation_id: self.conversation_id.to_string(),
                    bound: bound.to_string(),
                    offered: conversation.community_id.to_string(),
                });
            }
            // Same token; a state rebuilt from its directory only knows the token.
            Some(_) | None => self.community_id = Some(conversation.community_id.clone()),
        }
        self.community_name = conversation.community_name.clone();
        self.conversation_name = conversation.conversation_name.clone();
        Ok(())
    }
}

/// Per-conversation behavior switches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Options {
    pub enabled: bool,
    pub muted: bool,
    pub learning_enabled: bool,
    pub similarity_threshold: f32,
}

impl Options {
    pub fn with_threshold(similarity_threshold: f32) -> Self {
        Self {
            enabled: true,
            muted: false,
            learning_enabled: true,
            similarity_threshold,
        }
    }
}

/// Defaults applied to freshly created conversations.
#[derive(Debug, Clone, Copy)]
pub struct StateDefaults {
    pub history_max_chars: usize,
    pub similarity_threshold: f32,
}

/// Everything Chorus knows about one conversation.
#[derive(Debug, Clone)]
pub struct ConversationState {
    pub identity: Identity,
    pub options: Options,
    pub history: HistoryWindow,
    /// Sticky system turns. Never evicted.
    pub instructions: Vec<Turn>,
    /// Chunk documents keyed by source.
    pub documents: BTreeMap<String, Document>,
    /// Factoids keyed by normalized term.
    pub factoids: BTreeMap<String, Factoid>,
    pub match_stats: MatchStats,
    /// Opaque per-extension payloads keyed by extension id.
    pub module_payloads: BTreeMap<String, serde_json::Value>,
    /// Directory this state was loaded from or last saved to.
    pub storage_dir: Option<PathBuf>,
}

impl ConversationState {
    pub fn new(conversation_id: ConversationId, defaults: StateDefaults) -> Self {
        Self {
            identity: Identity::unbound(conversation_id),
            options: Options::with_threshold(defaults.similarity_threshold),
            history: HistoryWindow::new(defaults.history_max_chars),
            instructions: Vec::new(),
            documents: BTreeMap::new(),
            factoids: BTreeMap::new(),
            match_stats: MatchStats::default(),
            module_payloads: BTreeMap::new(),
            storage_dir: None,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.identity.conversation_id
    }

    pub fn community_id(&self) -> Option<&CommunityId> {
        self.identity.community_id.as_ref()
    }

    /// All stored chunks, in document order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.documents.values().flat_map(|d| d.chunks.iter())
    }

    pub fn image_chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks().filter(|c| c.is_image())
    }

    pub fn text_chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks().filter(|c| !c.is_image())
    }

    pub fn chunk_mut(&mut self, chunk_id: &str) -> Option<&mut Chunk> {
        self.documents
            .values_mut()
            .flat_map(|d| d.chunks.iter_mut())
            .find(|c| c.id == chunk_id)
    }

    /// Whether an attachment has already been ingested.
    pub fn has_attachment(&self, attachment_id: &str) -> bool {
        self.chunks()
            .any(|c| c.provenance.attachment_id.as_deref() == Some(attachment_id))
    }

    /// Insert or replace a document, stamping it with the bound community.
    pub fn put_document(&mut self, mut document: Document) {
        document.community_id = self.identity.community_id.clone();
        self.documents.insert(document.key.clone(), document);
    }

    /// Serializable snapshot of the state file portion.
    pub fn to_file(&self) -> StateFile {
        StateFile {
            identity: self.identity.clone(),
            options: self.options,
            history: self.history.to_vec(),
            instructions: self.instructions.clone(),
            module_payloads: self.module_payloads.clone(),
        }
    }

    /// Restore from a state file. Chunks, factoids and stats are loaded separately.
    pub fn from_file(file: StateFile, defaults: StateDefaults) -> Self {
        let mut state = Self::new(file.identity.conversation_id.clone(), defaults);
        state.identity = file.identity;
        state.options = file.options;
        state.history = HistoryWindow::from_turns(defaults.history_max_chars, file.history);
        state.instructions = file.instructions;
        state.module_payloads = file.module_payloads;
        state
    }
}

/// On-disk shape of the state file (history, instructions, options).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    pub identity: Identity,
    pub options: Options,
    #[serde(default)]
    pub history: Vec<Turn>,
    #[serde(default)]
    pub instructions: Vec<Turn>,
    #[serde(default)]
    pub module_payloads: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn conversation(community: &str) -> ConversationRef {
        ConversationRef {
            community_id: Arc::from(community),
            community_name: "Guild".into(),
            conversation_id: Arc::from("chan-1"),
            conversation_name: "general".into(),
        }
    }

    #[test]
    fn identity_binds_once() {
        let mut identity = Identity::unbound(Arc::from("chan-1"));
        identity.bind(&conversation("100")).expect("first bind");
        identity.bind(&conversation("100")).expect("same community");

        let error = identity
            .bind(&conversation("200"))
            .expect_err("rebinding must fail");
        assert!(matches!(error, StateError::IdentityConflict { .. }));
        assert_eq!(identity.community_id.as_deref(), Some("100"));
    }

    #[test]
    fn token_bound_identity_accepts_raw_id() {
        let mut identity = Identity::unbound(Arc::from("chan-1"));
        identity.community_id = Some(Arc::from("team-a-b"));

        identity
            .bind(&conversation("team.a.b"))
            .expect("same token as the directory");
        assert_eq!(identity.community_id.as_deref(), Some("team.a.b"));

        let error = identity
            .bind(&conversation("team.a.c"))
            .expect_err("different token must fail");
        assert!(matches!(error, StateError::IdentityConflict { .. }));
    }

    #[test]
    fn state_file_round_trip_recomputes_history_length() {
        let defaults = StateDefaults {
            history_max_chars: 100,
            similarity_threshold: 0.8,
        };
        let mut state = ConversationState::new(Arc::from("chan-1"), defaults);
        state.identity.bind(&conversation("100")).expect("bind");
        state.history.add_turn(Turn::user("alice", "hello"));
        state.history.add_turn(Turn::assistant("hi alice"));

        let json = serde_json::to_string(&state.to_file()).expect("serialize");
        let file: StateFile = serde_json::from_str(&json).expect("deserialize");
        let restored = ConversationState::from_file(file, defaults);

        assert_eq!(restored.history.len(), 2);
        assert_eq!(restored.history.length(), 13);
        assert_eq!(restored.identity.community_id.as_deref(), Some("100"));
    }
}
