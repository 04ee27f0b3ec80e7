//! In-crate fakes for the chat platform, the language model and the embedder.

use crate::error::{LlmError, MemoryError, Result};
use crate::llm::model::{ChatMessage, FragmentStream, LanguageModel};
use crate::memory::embedding::Embedder;
use crate::memory::ingest::AttachmentSource;
use crate::messaging::traits::{InboundStream, Messaging};
use crate::{
    Attachment, Author, CommandInvocation, ConversationRef, InboundMessage, OutboundResponse,
    ReplyTarget, StatusUpdate,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const FAKE_DIMENSIONS: usize = 32;

/// Deterministic bag-of-words embedder.
#[derive(Debug, Default)]
pub struct FakeEmbedder;

#[async_trait::async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0; FAKE_DIMENSIONS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            // FNV-1a
            let hash = word
                .to_lowercase()
                .bytes()
                .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
                    (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
                });
            vector[(hash % FAKE_DIMENSIONS as u64) as usize] += 1.0;
        }
        Ok(vector)
    }
}

/// Attachment bytes keyed by attachment id.
#[derive(Debug, Default)]
pub struct FakeAttachments {
    files: HashMap<String, Vec<u8>>,
}

impl FakeAttachments {
    pub fn with(id: &str, bytes: Vec<u8>) -> Self {
        Self {
            files: HashMap::from([(id.to_string(), bytes)]),
        }
    }
}

#[async_trait::async_trait]
impl AttachmentSource for FakeAttachments {
    async fn fetch(&self, attachment: &Attachment) -> Result<Vec<u8>> {
        self.files.get(&attachment.id).cloned().ok_or_else(|| {
            MemoryError::DownloadFailed {
                filename: attachment.filename.clone(),
                message: "not found".into(),
            }
            .into()
        })
    }
}

/// Streams a scripted answer. No fragments means the call fails.
#[derive(Debug, Default)]
pub struct FakeModel {
    fragments: Vec<String>,
    stall_marker: Option<String>,
    calls: AtomicUsize,
    descriptions: AtomicUsize,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl FakeModel {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Never answer a prompt whose last message contains `marker`.
    pub fn stall_on(mut self, marker: &str) -> Self {
        self.stall_marker = Some(marker.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn descriptions(&self) -> usize {
        self.descriptions.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait::async_trait]
impl LanguageModel for FakeModel {
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<FragmentStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stalled = self.stall_marker.as_deref().is_some_and(|marker| {
            messages
                .last()
                .is_some_and(|message| message.content.contains(marker))
        });
        self.prompts.lock().expect("prompts lock").push(messages);
        if stalled {
            std::future::pending::<()>().await;
        }
        if self.fragments.is_empty() {
            return Err(LlmError::CompletionFailed("scripted failure".into()).into());
        }
        let fragments: Vec<Result<String>> = self.fragments.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(fragments)))
    }

    async fn describe_image(&self, _prompt: &str, _image: &[u8], _mime_type: &str) -> Result<String> {
        self.descriptions.fetch_add(1, Ordering::SeqCst);
        Ok("a scripted description".into())
    }
}

/// Records everything sent to the platform.
#[derive(Debug, Default)]
pub struct FakeMessaging {
    sent: Mutex<Vec<(ReplyTarget, OutboundResponse)>>,
    statuses: Mutex<Vec<StatusUpdate>>,
}

impl FakeMessaging {
    pub fn sent(&self) -> Vec<(ReplyTarget, OutboundResponse)> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn statuses(&self) -> Vec<StatusUpdate> {
        self.statuses.lock().expect("statuses lock").clone()
    }
}

impl Messaging for FakeMessaging {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start(&self) -> Result<InboundStream> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn respond(&self, target: &ReplyTarget, response: OutboundResponse) -> Result<()> {
        self.sent
            .lock()
            .expect("sent lock")
            .push((target.clone(), response));
        Ok(())
    }

    async fn send_status(&self, _target: &ReplyTarget, status: StatusUpdate) -> Result<()> {
        self.statuses.lock().expect("statuses lock").push(status);
        Ok(())
    }
}

pub fn conversation_ref() -> ConversationRef {
    ConversationRef {
        community_id: Arc::from("100"),
        community_name: "Guild".into(),
        conversation_id: Arc::from("chan-1"),
        conversation_name: "general".into(),
    }
}

fn alice() -> Author {
    Author {
        id: "u1".into(),
        display_name: "alice".into(),
        is_bot: false,
    }
}

pub fn inbound_message(id: &str, content: &str) -> InboundMessage {
    InboundMessage {
        id: id.into(),
        conversation: conversation_ref(),
        author: alice(),
        content: content.into(),
        attachments: Vec::new(),
        reply_to: None,
        timestamp: chrono::Utc::now(),
    }
}

pub fn command(name: &str, subcommand: Option<&str>, args: &[&str]) -> CommandInvocation {
    CommandInvocation {
        id: format!("cmd-{name}"),
        conversation: conversation_ref(),
        author: alice(),
        name: name.into(),
        subcommand: subcommand.map(Into::into),
        args: args.iter().map(|a| a.to_string()).collect(),
    }
}
