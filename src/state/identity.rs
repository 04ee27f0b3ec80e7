//! Process-lifetime conversation → community registry.

use crate::error::StateError;
use crate::state::layout::community_token;
use crate::ConversationId;

use std::collections::HashMap;
use tokio::sync::RwLock;

/// Records which community each conversation resolved to on first clean
/// resolution, and validates every later artifact or event against it.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    bindings: RwLock<HashMap<ConversationId, String>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify `community` against the recorded binding, registering it if the
    /// conversation has none yet.
    pub async fn check_and_bind(
        &self,
        conversation_id: &ConversationId,
        community: &str,
    ) -> Result<(), StateError> {
        let token = community_token(community);
        let mut bindings = self.bindings.write().await;
        match bindings.get(conversation_id) {
            Some(bound) if *bound != token => Err(StateError::IdentityConflict {
                conversation_id: conversation_id.to_string(),
                bound: bound.clone(),
                offered: token,
            }),
            Some(_) => Ok(()),
            None => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    community = %token,
                    "registered conversation identity"
                );
                bindings.insert(conversation_id.clone(), token);
                Ok(())
            }
        }
    }
}
