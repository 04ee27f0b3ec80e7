//! Chorus: a conversational agent client for group-chat platforms.
//!
//! Every conversation owns bounded, identity-validated state. Each turn is
//! augmented with retrieved context, fanned out to extension modules, and
//! the model's streamed answer is assembled into platform-legal deliveries.

pub mod agent;
pub mod config;
pub mod conversation;
pub mod delivery;
pub mod error;
pub mod extensions;
pub mod llm;
pub mod memory;
pub mod messaging;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Community (guild / workspace) identifier type.
pub type CommunityId = Arc<str>;

/// Conversation (channel) identifier type.
pub type ConversationId = Arc<str>;

/// Where an event happened: the community and conversation it belongs to,
/// with the display names used to build the on-disk layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationRef {
    pub community_id: CommunityId,
    pub community_name: String,
    pub conversation_id: ConversationId,
    pub conversation_name: String,
}

/// Who sent a message or triggered an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Author {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub is_bot: bool,
}

/// Events delivered by the chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Message(InboundMessage),
    MessageUpdated(InboundMessage),
    ReactionAdded(ReactionEvent),
    Command(CommandInvocation),
    Interaction(InteractionEvent),
}

impl InboundEvent {
    /// The conversation this event belongs to.
    pub fn conversation(&self) -> &ConversationRef {
        match self {
            InboundEvent::Message(message) | InboundEvent::MessageUpdated(message) => {
                &message.conversation
            }
            InboundEvent::ReactionAdded(reaction) => &reaction.conversation,
            InboundEvent::Command(command) => &command.conversation,
            InboundEvent::Interaction(interaction) => &interaction.conversation,
        }
    }
}

/// Inbound message from the chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub conversation: ConversationRef,
    pub author: Author,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// The message this one replies to, if any.
    #[serde(default)]
    pub reply_to: Option<ReplyReference>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl InboundMessage {
    /// Image attachments on this message.
    pub fn image_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter().filter(|a| a.is_image())
    }
}

/// A reference to the message being replied to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyReference {
    pub message_id: String,
    /// Who posted the replied-to message, when the platform says.
    #[serde(default)]
    pub author: Option<Author>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// File attachment metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub url: String,
    pub size_bytes: Option<u64>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    pub fn is_text(&self) -> bool {
        self.mime_type.starts_with("text/")
            || self.mime_type == "application/json"
            || self.mime_type == "application/xml"
    }
}

/// A reaction added to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionEvent {
    pub conversation: ConversationRef,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
}

/// A structured command, e.g. `/chorus threshold 0.7`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandInvocation {
    pub id: String,
    pub conversation: ConversationRef,
    pub author: Author,
    /// Top-level command name.
    pub name: String,
    /// Subcommand inside the top-level group, if any.
    #[serde(default)]
    pub subcommand: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A component interaction (button click, select menu).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub id: String,
    pub conversation: ConversationRef,
    pub author: Author,
    pub custom_id: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Where an outbound response goes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyTarget {
    pub conversation: ConversationRef,
    /// Message to reply to or react on. None posts a plain message.
    pub message_id: Option<String>,
}

impl ReplyTarget {
    pub fn message(conversation: &ConversationRef, message_id: impl Into<String>) -> Self {
        Self {
            conversation: conversation.clone(),
            message_id: Some(message_id.into()),
        }
    }

    pub fn conversation(conversation: &ConversationRef) -> Self {
        Self {
            conversation: conversation.clone(),
            message_id: None,
        }
    }
}

/// Outbound response to the chat platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboundResponse {
    Text(String),
    /// Send a file attachment, optionally captioned with text in the same message.
    File {
        filename: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        mime_type: String,
        caption: Option<String>,
    },
    /// Add a reaction emoji to the target message.
    Reaction(String),
    /// Remove a reaction emoji from the target message.
    RemoveReaction(String),
}

/// Serde helper for encoding `Vec<u8>` as base64 in JSON.
mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

/// Status updates for the chat platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusUpdate {
    Typing,
    StopTyping,
}
