//! Conversation state store: resolve/create, load with identity validation, save.

use crate::error::{Result, StateError};
use crate::memory::types::{Document, Factoid, MatchLogEntry, MatchStats};
use crate::state::identity::IdentityRegistry;
use crate::state::layout::{
    self, ArtifactKind, ParsedArtifact, community_token, dir_name, parse_artifact_name,
    parse_dir_id, parse_dir_name, sanitize_key,
};
use crate::state::types::{ConversationState, StateDefaults, StateFile};
use crate::{ConversationId, ConversationRef};

use anyhow::Context as _;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::{Mutex, RwLock};

/// Shared, exclusively-locked handle to one conversation's state.
///
/// Holding the lock for the duration of an event is what serializes a
/// conversation's events; different conversations never share a lock.
pub type ConversationHandle = Arc<Mutex<ConversationState>>;

/// Counts from a `load()` pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub conversations: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub adopted: usize,
    pub superseded: usize,
    pub corrupt: usize,
}

/// Owns every conversation's in-memory state and its on-disk artifacts.
pub struct StateStore {
    root: PathBuf,
    defaults: StateDefaults,
    registry: IdentityRegistry,
    conversations: RwLock<HashMap<ConversationId, ConversationHandle>>,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>, defaults: StateDefaults) -> Self {
        Self {
            root: root.into(),
            defaults,
            registry: IdentityRegistry::new(),
            conversations: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn defaults(&self) -> StateDefaults {
        self.defaults
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    /// Existing state for a conversation, if any.
    pub async fn get(&self, conversation_id: &str) -> Option<ConversationHandle> {
        self.conversations.read().await.get(conversation_id).cloned()
    }

    /// Existing state, or a default-initialized one bound to this community.
    ///
    /// Fails when the conversation is already bound to a different community.
    pub async fn get_or_create(
        &self,
        conversation: &ConversationRef,
    ) -> std::result::Result<ConversationHandle, StateError> {
        self.registry
            .check_and_bind(&conversation.conversation_id, &conversation.community_id)
            .await?;

        if let Some(handle) = self.get(&conversation.conversation_id).await {
            return Ok(handle);
        }

        let mut conversations = self.conversations.write().await;
        let handle = conversations
            .entry(conversation.conversation_id.clone())
            .or_insert_with(|| {
                let mut state =
                    ConversationState::new(conversation.conversation_id.clone(), self.defaults);
                state.identity.community_id = Some(conversation.community_id.clone());
                state.identity.community_name = conversation.community_name.clone();
                state.identity.conversation_name = conversation.conversation_name.clone();
                tracing::debug!(
                    conversation_id = %conversation.conversation_id,
                    community_id = %conversation.community_id,
                    "created conversation state"
                );
                Arc::new(Mutex::new(state))
            })
            .clone();
        Ok(handle)
    }

    /// All loaded conversation handles.
    pub async fn handles(&self) -> Vec<ConversationHandle> {
        self.conversations.read().await.values().cloned().collect()
    }

    /// Scan persisted artifacts and load every conversation that validates.
    pub async fn load(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        let community_dirs = match sorted_subdirs(&self.root).await {
            Ok(dirs) => dirs,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(root = %self.root.display(), "no persisted state yet");
                return Ok(report);
            }
            Err(error) => return Err(error.into()),
        };

        for community_dir in community_dirs {
            let Some(dir_token) = file_name(&community_dir).and_then(parse_dir_id) else {
                tracing::warn!(path = %community_dir.display(), "skipping directory without community id");
                continue;
            };
            let dir_token = dir_token.to_string();
            let community_name = file_name(&community_dir)
                .map(parse_dir_name)
                .unwrap_or_default()
                .to_string();

            let conversation_dirs = match sorted_subdirs(&community_dir).await {
                Ok(dirs) => dirs,
                Err(error) => {
                    tracing::warn!(%error, path = %community_dir.display(), "failed to scan community directory");
                    continue;
                }
            };

            for conversation_dir in conversation_dirs {
                let Some(conversation_id) = file_name(&conversation_dir).and_then(parse_dir_id)
                else {
                    tracing::warn!(path = %conversation_dir.display(), "skipping directory without conversation id");
                    continue;
                };
                let conversation_id: ConversationId = Arc::from(conversation_id);
                let conversation_name = file_name(&conversation_dir)
                    .map(parse_dir_name)
                    .unwrap_or_default()
                    .to_string();

                let loaded = self
                    .load_conversation_dir(
                        &conversation_dir,
                        &dir_token,
                        &community_name,
                        &conversation_id,
                        &conversation_name,
                        &mut report,
                    )
                    .await;
                if loaded {
                    report.conversations += 1;
                }
            }
        }

        tracing::info!(
            conversations = report.conversations,
            accepted = report.accepted,
            rejected = report.rejected,
            adopted = report.adopted,
            superseded = report.superseded,
            corrupt = report.corrupt,
            "conversation state loaded"
        );

        Ok(report)
    }

    /// Load one conversation directory. Returns whether a state was registered.
    async fn load_conversation_dir(
        &self,
        dir: &Path,
        dir_token: &str,
        community_name: &str,
        conversation_id: &ConversationId,
        conversation_name: &str,
        report: &mut LoadReport,
    ) -> bool {
        let artifacts = match list_artifacts(dir).await {
            Ok(artifacts) => artifacts,
            Err(error) => {
                tracing::warn!(%error, path = %dir.display(), "failed to list conversation directory");
                return false;
            }
        };

        // Checked before anything is adopted so a skipped directory stays untouched.
        if self.get(conversation_id).await.is_some() {
            tracing::warn!(
                conversation_id = %conversation_id,
                path = %dir.display(),
                "conversation already loaded from another directory, skipping"
            );
            report.rejected += artifacts.len();
            return false;
        }

        let tokenized_keys: HashSet<String> = artifacts
            .iter()
            .filter(|(_, parsed)| parsed.token.is_some())
            .map(|(_, parsed)| parsed.logical_key())
            .collect();

        let mut accepted: Vec<(PathBuf, ArtifactKind)> = Vec::new();

        for (path, parsed) in artifacts {
            match parsed.token {
                Some(ref token) => {
                    if token != dir_token {
                        tracing::warn!(
                            path = %path.display(),
                            token = %token,
                            directory_community = %dir_token,
                            "rejecting artifact: community token does not match directory"
                        );
                        report.rejected += 1;
                        continue;
                    }
                    if let Err(error) = self.registry.check_and_bind(conversation_id, token).await {
                        tracing::warn!(%error, path = %path.display(), "rejecting artifact");
                        report.rejected += 1;
                        continue;
                    }
                    accepted.push((path, parsed.kind));
                }
                None => {
                    if tokenized_keys.contains(&parsed.logical_key()) {
                        tracing::info!(
                            path = %path.display(),
                            "ignoring legacy artifact superseded by tokenized artifact"
                        );
                        report.superseded += 1;
                        continue;
                    }
                    if let Err(error) = self
                        .registry
                        .check_and_bind(conversation_id, dir_token)
                        .await
                    {
                        tracing::warn!(%error, path = %path.display(), "rejecting legacy artifact");
                        report.rejected += 1;
                        continue;
                    }
                    match adopt_legacy(&path, &parsed.kind, dir_token).await {
                        Ok(new_path) => {
                            tracing::info!(
                                from = %path.display(),
                                to = %new_path.display(),
                                "adopted legacy artifact"
                            );
                            report.adopted += 1;
                            accepted.push((new_path, parsed.kind));
                        }
                        Err(error) => {
                            tracing::warn!(%error, path = %path.display(), "failed to adopt legacy artifact");
                            report.rejected += 1;
                        }
                    }
                }
            }
        }

        if accepted.is_empty() {
            return false;
        }

        let mut state: Option<ConversationState> = None;
        let mut documents: Vec<Document> = Vec::new();
        let mut factoids: Vec<Factoid> = Vec::new();
        let mut stats: Option<MatchStats> = None;

        for (path, kind) in accepted {
            let outcome = match kind {
                ArtifactKind::State => {
                    read_json::<StateFile>(&path).await.and_then(|file| {
                        verify_embedded(&path, file.identity.community_id.as_deref(), dir_token)?;
                        if file.identity.conversation_id != *conversation_id {
                            return Err(StateError::ArtifactRejected {
                                path: path.display().to_string(),
                                reason: format!(
                                    "embedded conversation {} does not match directory",
                                    file.identity.conversation_id
                                ),
                            }
                            .into());
                        }
                        state = Some(ConversationState::from_file(file, self.defaults));
                        Ok(())
                    })
                }
                ArtifactKind::Chunks { .. } => read_json::<Document>(&path).await.and_then(|doc| {
                    verify_embedded(&path, doc.community_id.as_deref(), dir_token)?;
                    documents.push(doc);
                    Ok(())
                }),
                ArtifactKind::Factoid { .. } => {
                    read_json::<Factoid>(&path).await.and_then(|factoid| {
                        verify_embedded(
                            &path,
                            Some(factoid.provenance.community_id.as_str()),
                            dir_token,
                        )?;
                        factoids.push(factoid);
                        Ok(())
                    })
                }
                ArtifactKind::MatchStats => {
                    read_json::<MatchStats>(&path).await.and_then(|loaded| {
                        verify_embedded(&path, loaded.community_id.as_deref(), dir_token)?;
                        stats = Some(loaded);
                        Ok(())
                    })
                }
                // Append-only; nothing to hold in memory.
                ArtifactKind::MatchLog => Ok(()),
            };

            match outcome {
                Ok(()) => report.accepted += 1,
                Err(crate::Error::State(error)) => {
                    tracing::warn!(%error, "rejecting artifact with conflicting embedded identity");
                    report.rejected += 1;
                }
                Err(error) => {
                    tracing::warn!(%error, path = %path.display(), "treating corrupt artifact as absent");
                    report.corrupt += 1;
                }
            }
        }

        let mut state = state.unwrap_or_else(|| {
            let mut fresh = ConversationState::new(conversation_id.clone(), self.defaults);
            fresh.identity.community_id = Some(Arc::from(dir_token));
            fresh.identity.community_name = community_name.to_string();
            fresh.identity.conversation_name = conversation_name.to_string();
            fresh
        });

        for document in documents {
            state.documents.insert(document.key.clone(), document);
        }
        for factoid in factoids {
            state.factoids.insert(factoid.term.clone(), factoid);
        }
        if let Some(stats) = stats {
            state.match_stats = stats;
        }
        state.storage_dir = Some(dir.to_path_buf());

        self.conversations
            .write()
            .await
            .insert(conversation_id.clone(), Arc::new(Mutex::new(state)));
        true
    }

    /// Directory a conversation persists into.
    pub fn conversation_dir(
        &self,
        state: &ConversationState,
    ) -> std::result::Result<PathBuf, StateError> {
        if let Some(dir) = &state.storage_dir {
            return Ok(dir.clone());
        }
        let community = state
            .community_id()
            .ok_or_else(|| StateError::Unbound {
                conversation_id: state.conversation_id().to_string(),
            })?;
        Ok(self
            .root
            .join(dir_name(&state.identity.community_name, community))
            .join(dir_name(
                &state.identity.conversation_name,
                state.conversation_id(),
            )))
    }

    /// Where stored image attachments for a conversation go.
    pub fn attachments_dir(
        &self,
        state: &ConversationState,
    ) -> std::result::Result<PathBuf, StateError> {
        Ok(self.conversation_dir(state)?.join(layout::ATTACHMENTS_DIR))
    }

    /// Persist a conversation's state file, documents, factoids and statistics.
    pub async fn save(&self, state: &mut ConversationState) -> Result<()> {
        let community = state
            .community_id()
            .cloned()
            .ok_or_else(|| StateError::Unbound {
                conversation_id: state.conversation_id().to_string(),
            })?;
        let dir = self.conversation_dir(state)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;

        write_json(
            &dir.join(ArtifactKind::State.file_name(Some(&*community))),
            &state.to_file(),
        )
        .await?;

        let mut live_files = HashSet::new();
        for document in state.documents.values_mut() {
            document.community_id = Some(community.clone());
            let kind = ArtifactKind::Chunks {
                key: sanitize_key(&document.key),
            };
            let name = kind.file_name(Some(&*community));
            write_json(&dir.join(&name), document).await?;
            live_files.insert(name);
        }
        for factoid in state.factoids.values() {
            let kind = ArtifactKind::Factoid {
                slug: sanitize_key(&factoid.term),
            };
            let name = kind.file_name(Some(&*community));
            write_json(&dir.join(&name), factoid).await?;
            live_files.insert(name);
        }

        state.match_stats.community_id = Some(community.clone());
        write_json(
            &dir.join(ArtifactKind::MatchStats.file_name(Some(&*community))),
            &state.match_stats,
        )
        .await?;

        remove_stale_artifacts(&dir, &community_token(&community), &live_files).await;

        state.storage_dir = Some(dir.clone());
        tracing::debug!(
            conversation_id = %state.conversation_id(),
            path = %dir.display(),
            "conversation state saved"
        );
        Ok(())
    }

    /// Best-effort save of every loaded conversation. Returns the failure count.
    pub async fn save_all(&self) -> usize {
        let mut failures = 0;
        for handle in self.handles().await {
            let mut state = handle.lock().await;
            if let Err(error) = self.save(&mut state).await {
                tracing::error!(
                    %error,
                    conversation_id = %state.conversation_id(),
                    "failed to save conversation state"
                );
                failures += 1;
            }
        }
        failures
    }

    /// Append one line to the conversation's factoid match log.
    pub async fn append_match_log(
        &self,
        state: &ConversationState,
        entry: &MatchLogEntry,
    ) -> Result<()> {
        let community = state
            .community_id()
            .ok_or_else(|| StateError::Unbound {
                conversation_id: state.conversation_id().to_string(),
            })?;
        let dir = self.conversation_dir(state)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(ArtifactKind::MatchLog.file_name(Some(&**community)));

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to append to {}", path.display()))?;
        Ok(())
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

async fn sorted_subdirs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn list_artifacts(dir: &Path) -> std::io::Result<Vec<(PathBuf, ParsedArtifact)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut artifacts = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        let Some(parsed) = file_name(&path).and_then(parse_artifact_name) else {
            tracing::debug!(path = %path.display(), "ignoring unrecognized file");
            continue;
        };
        artifacts.push((path, parsed));
    }
    artifacts.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(artifacts)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(value)
}

/// Write via a temp file and rename so readers never see a partial file.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp",
        file_name(path).unwrap_or("artifact")
    ));
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|error| StateError::SaveFailed {
            path: tmp.display().to_string(),
            message: error.to_string(),
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|error| StateError::SaveFailed {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
    Ok(())
}

fn verify_embedded(path: &Path, embedded: Option<&str>, dir_token: &str) -> Result<()> {
    match embedded {
        Some(community) if community_token(community) != dir_token => {
            Err(StateError::ArtifactRejected {
                path: path.display().to_string(),
                reason: format!(
                    "embedded community {community} conflicts with established community {dir_token}"
                ),
            }
            .into())
        }
        _ => Ok(()),
    }
}

/// Stamp a legacy artifact with its resolved community, rewrite it under the
/// tokenized name, and remove the legacy file.
async fn adopt_legacy(path: &Path, kind: &ArtifactKind, community: &str) -> Result<PathBuf> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let stamped = if matches!(kind, ArtifactKind::MatchLog) {
        raw
    } else {
        let mut value: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse legacy artifact {}", path.display()))?;
        let pointer = match kind {
            ArtifactKind::State => "/identity/community_id",
            ArtifactKind::Factoid { .. } => "/provenance/community_id",
            _ => "/community_id",
        };
        let existing = value
            .pointer(pointer)
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if let Some(existing) = existing {
            verify_embedded(path, Some(&existing), community)?;
        }
        let stamp = serde_json::Value::String(community.to_string());
        if let Some(slot) = value.pointer_mut(pointer) {
            *slot = stamp;
        } else if pointer == "/community_id"
            && let Some(object) = value.as_object_mut()
        {
            object.insert("community_id".into(), stamp);
        }
        serde_json::to_string_pretty(&value)?
    };

    let new_path = path.with_file_name(kind.file_name(Some(community)));
    let tmp = path.with_file_name(format!(".{}.tmp", kind.file_name(Some(community))));
    tokio::fs::write(&tmp, stamped.as_bytes())
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &new_path)
        .await
        .with_context(|| format!("failed to write {}", new_path.display()))?;
    tokio::fs::remove_file(path)
        .await
        .with_context(|| format!("failed to remove legacy artifact {}", path.display()))?;
    Ok(new_path)
}

/// Remove tokenized chunk and factoid files that no longer back in-memory content.
async fn remove_stale_artifacts(dir: &Path, token: &str, live_files: &HashSet<String>) {
    let artifacts = match list_artifacts(dir).await {
        Ok(artifacts) => artifacts,
        Err(error) => {
            tracing::warn!(%error, path = %dir.display(), "failed to scan for stale artifacts");
            return;
        }
    };
    for (path, parsed) in artifacts {
        let removable = matches!(
            parsed.kind,
            ArtifactKind::Chunks { .. } | ArtifactKind::Factoid { .. }
        ) && parsed.token.as_deref() == Some(token);
        let name = file_name(&path).unwrap_or_default();
        if removable && !live_files.contains(name) {
            if let Err(error) = tokio::fs::remove_file(&path).await {
                tracing::warn!(%error, path = %path.display(), "failed to remove stale artifact");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::history::Turn;
    use crate::memory::types::{Chunk, FactoidProvenance, Provenance};
    use tempfile::TempDir;

    fn defaults() -> StateDefaults {
        StateDefaults {
            history_max_chars: 1_000,
            similarity_threshold: 0.8,
        }
    }

    fn conversation(community: &str, conversation: &str) -> ConversationRef {
        ConversationRef {
            community_id: Arc::from(community),
            community_name: "Test Guild".into(),
            conversation_id: Arc::from(conversation),
            conversation_name: "general".into(),
        }
    }

    fn state_json(community: Option<&str>, conversation: &str, turn: &str) -> serde_json::Value {
        serde_json::json!({
            "identity": {
                "community_id": community,
                "community_name": "test-guild",
                "conversation_id": conversation,
                "conversation_name": "general",
            },
            "options": {
                "enabled": true,
                "muted": false,
                "learning_enabled": true,
                "similarity_threshold": 0.8,
            },
            "history": [
                { "role": "user", "author": "alice", "content": turn, "timestamp": "2024-01-01T00:00:00Z" }
            ],
        })
    }

    async fn write_fixture(dir: &Path, name: &str, value: &serde_json::Value) {
        tokio::fs::create_dir_all(dir).await.expect("fixture dir");
        tokio::fs::write(dir.join(name), serde_json::to_vec(value).expect("json"))
            .await
            .expect("fixture write");
    }

    async fn first_turn(store: &StateStore, conversation: &str) -> Option<String> {
        let handle = store.get(conversation).await?;
        let state = handle.lock().await;
        state.history.turns().next().map(|t| t.content.clone())
    }

    #[tokio::test]
    async fn save_then_load_restores_state() {
        let temp = TempDir::new().expect("tempdir");
        let store = StateStore::new(temp.path(), defaults());
        let handle = store
            .get_or_create(&conversation("100", "555"))
            .await
            .expect("create");

        {
            let mut state = handle.lock().await;
            state.history.add_turn(Turn::user("alice", "hello there"));
            state.options.muted = true;
            let provenance = Provenance {
                community_id: "100".into(),
                conversation_id: "555".into(),
                message_id: "m1".into(),
                attachment_id: None,
                author_id: None,
                author_name: None,
            };
            let mut document = Document::new("msg-m1", None);
            document
                .chunks
                .push(Chunk::new("some text", vec![1.0, 0.0], provenance));
            state.put_document(document);
            state.factoids.insert(
                "foo".into(),
                Factoid {
                    term: "foo".into(),
                    fact: "a metasyntactic variable".into(),
                    embedding: vec![0.0, 1.0],
                    provenance: FactoidProvenance {
                        supplier_id: "u1".into(),
                        supplier_name: "alice".into(),
                        community_id: "100".into(),
                        conversation_id: "555".into(),
                        message_id: "m1".into(),
                    },
                    created_at: chrono::Utc::now(),
                },
            );
            store.save(&mut state).await.expect("save");
        }

        let reloaded = StateStore::new(temp.path(), defaults());
        let report = reloaded.load().await.expect("load");
        assert_eq!(report.conversations, 1);
        assert_eq!(report.rejected, 0);

        let handle = reloaded.get("555").await.expect("conversation loaded");
        let state = handle.lock().await;
        assert_eq!(state.history.length(), "hello there".len());
        assert!(state.options.muted);
        assert_eq!(state.chunks().count(), 1);
        assert!(state.factoids.contains_key("foo"));
        assert_eq!(state.community_id().map(|c| c.as_ref()), Some("100"));
    }

    #[tokio::test]
    async fn conflicting_communities_accept_at_most_one() {
        let temp = TempDir::new().expect("tempdir");
        let first = temp.path().join("alpha_100").join("general_555");
        let second = temp.path().join("beta_200").join("general_555");
        write_fixture(&first, "state.g100.json", &state_json(Some("100"), "555", "from alpha")).await;
        write_fixture(&second, "state.g200.json", &state_json(Some("200"), "555", "from beta")).await;

        let store = StateStore::new(temp.path(), defaults());
        let report = store.load().await.expect("load");

        assert_eq!(report.conversations, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(first_turn(&store, "555").await.as_deref(), Some("from alpha"));

        let error = store
            .get_or_create(&conversation("200", "555"))
            .await
            .expect_err("rebinding must be refused");
        assert!(matches!(error, StateError::IdentityConflict { .. }));
    }

    #[tokio::test]
    async fn token_mismatching_directory_is_rejected() {
        let temp = TempDir::new().expect("tempdir");
        let dir = temp.path().join("alpha_100").join("general_555");
        write_fixture(&dir, "state.g999.json", &state_json(Some("999"), "555", "smuggled")).await;

        let store = StateStore::new(temp.path(), defaults());
        let report = store.load().await.expect("load");

        assert_eq!(report.rejected, 1);
        assert!(store.get("555").await.is_none());

        let handle = store
            .get_or_create(&conversation("100", "555"))
            .await
            .expect("fresh state");
        assert!(handle.lock().await.history.is_empty());
    }

    #[tokio::test]
    async fn embedded_identity_conflict_falls_back_to_default() {
        let temp = TempDir::new().expect("tempdir");
        let dir = temp.path().join("alpha_100").join("general_555");
        write_fixture(&dir, "state.g100.json", &state_json(Some("999"), "555", "forged")).await;

        let store = StateStore::new(temp.path(), defaults());
        let report = store.load().await.expect("load");

        assert_eq!(report.rejected, 1);
        assert_eq!(first_turn(&store, "555").await, None);
    }

    #[tokio::test]
    async fn legacy_artifact_is_adopted_once() {
        let temp = TempDir::new().expect("tempdir");
        let dir = temp.path().join("alpha_100").join("general_555");
        write_fixture(&dir, "state.json", &state_json(None, "555", "legacy hello")).await;

        let store = StateStore::new(temp.path(), defaults());
        let report = store.load().await.expect("load");

        assert_eq!(report.adopted, 1);
        assert!(!dir.join("state.json").exists());
        assert!(dir.join("state.g100.json").exists());
        assert_eq!(first_turn(&store, "555").await.as_deref(), Some("legacy hello"));

        let rewritten: serde_json::Value = serde_json::from_str(
            &tokio::fs::read_to_string(dir.join("state.g100.json"))
                .await
                .expect("read"),
        )
        .expect("json");
        assert_eq!(rewritten["identity"]["community_id"], "100");
    }

    #[tokio::test]
    async fn duplicate_directory_keeps_legacy_files_in_place() {
        let temp = TempDir::new().expect("tempdir");
        let first = temp.path().join("alpha_100").join("general_555");
        let second = temp.path().join("beta_100").join("general_555");
        write_fixture(&first, "state.g100.json", &state_json(Some("100"), "555", "from alpha")).await;
        write_fixture(&second, "state.json", &state_json(None, "555", "stray copy")).await;

        let store = StateStore::new(temp.path(), defaults());
        let report = store.load().await.expect("load");

        assert_eq!(report.conversations, 1);
        assert_eq!(report.adopted, 0);
        assert_eq!(report.rejected, 1);
        assert!(second.join("state.json").exists());
        assert!(!second.join("state.g100.json").exists());
        assert_eq!(first_turn(&store, "555").await.as_deref(), Some("from alpha"));
    }

    #[tokio::test]
    async fn tokenized_artifact_beats_legacy() {
        let temp = TempDir::new().expect("tempdir");
        let dir = temp.path().join("alpha_100").join("general_555");
        write_fixture(&dir, "state.json", &state_json(None, "555", "legacy")).await;
        write_fixture(&dir, "state.g100.json", &state_json(Some("100"), "555", "tokenized")).await;

        let store = StateStore::new(temp.path(), defaults());
        let report = store.load().await.expect("load");

        assert_eq!(report.superseded, 1);
        assert_eq!(report.adopted, 0);
        assert_eq!(first_turn(&store, "555").await.as_deref(), Some("tokenized"));
    }

    #[tokio::test]
    async fn corrupt_state_is_treated_as_absent() {
        let temp = TempDir::new().expect("tempdir");
        let dir = temp.path().join("alpha_100").join("general_555");
        tokio::fs::create_dir_all(&dir).await.expect("dir");
        tokio::fs::write(dir.join("state.g100.json"), b"{ not json")
            .await
            .expect("write");

        let store = StateStore::new(temp.path(), defaults());
        let report = store.load().await.expect("load");

        assert_eq!(report.corrupt, 1);
        let handle = store.get("555").await.expect("fresh state registered");
        let state = handle.lock().await;
        assert!(state.history.is_empty());
        assert_eq!(state.community_id().map(|c| c.as_ref()), Some("100"));
    }

    #[tokio::test]
    async fn forgotten_factoids_are_removed_on_save() {
        let temp = TempDir::new().expect("tempdir");
        let store = StateStore::new(temp.path(), defaults());
        let handle = store
            .get_or_create(&conversation("100", "555"))
            .await
            .expect("create");
        let mut state = handle.lock().await;
        state.factoids.insert(
            "bar".into(),
            Factoid {
                term: "bar".into(),
                fact: "a place".into(),
                embedding: vec![],
                provenance: FactoidProvenance {
                    supplier_id: "u1".into(),
                    supplier_name: "alice".into(),
                    community_id: "100".into(),
                    conversation_id: "555".into(),
                    message_id: "m1".into(),
                },
                created_at: chrono::Utc::now(),
            },
        );
        store.save(&mut state).await.expect("save");
        let dir = state.storage_dir.clone().expect("dir");
        let count = |dir: PathBuf| async move {
            list_artifacts(&dir)
                .await
                .expect("list")
                .into_iter()
                .filter(|(_, p)| matches!(p.kind, ArtifactKind::Factoid { .. }))
                .count()
        };
        assert_eq!(count(dir.clone()).await, 1);

        state.factoids.clear();
        store.save(&mut state).await.expect("save");
        assert_eq!(count(dir).await, 0);
    }
}
