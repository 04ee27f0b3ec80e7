//! Extension contract: descriptor, lifecycle and content hooks.

use crate::config::Config;
use crate::error::Result;
use crate::extensions::commands::CommandContribution;
use crate::memory::embedding::Embedder;
use crate::state::types::ConversationState;
use crate::{
    CommandInvocation, ConversationRef, InboundMessage, InteractionEvent, OutboundResponse,
    ReactionEvent,
};

use std::collections::BTreeSet;
use std::sync::Arc;

/// Pipeline entry points a module can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Hook {
    Init,
    Ready,
    Message,
    MessageUpdated,
    Reaction,
    Command,
    Interaction,
    GatherContext,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::Init => "init",
            Hook::Ready => "ready",
            Hook::Message => "message",
            Hook::MessageUpdated => "message_updated",
            Hook::Reaction => "reaction",
            Hook::Command => "command",
            Hook::Interaction => "interaction",
            Hook::GatherContext => "gather_context",
        }
    }
}

/// Identity and wiring of one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub id: String,
    pub name: String,
    pub dependencies: Vec<String>,
    pub hooks: BTreeSet<Hook>,
}

impl ModuleDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            dependencies: Vec::new(),
            hooks: BTreeSet::new(),
        }
    }

    pub fn depends_on(mut self, dependencies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_hooks(mut self, hooks: impl IntoIterator<Item = Hook>) -> Self {
        self.hooks.extend(hooks);
        self
    }

    pub fn implements(&self, hook: Hook) -> bool {
        self.hooks.contains(&hook)
    }
}

/// Shared services injected into every module.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub embedder: Arc<dyn Embedder>,
}

/// Per-event view handed to conversation hooks.
///
/// Modules mutate the conversation state directly and queue replies; the
/// engine delivers queued replies once the fan-out completes.
pub struct HookContext<'a> {
    pub conversation: &'a ConversationRef,
    pub state: &'a mut ConversationState,
    pub services: &'a Services,
    replies: Vec<OutboundResponse>,
}

impl<'a> HookContext<'a> {
    pub fn new(
        conversation: &'a ConversationRef,
        state: &'a mut ConversationState,
        services: &'a Services,
    ) -> Self {
        Self {
            conversation,
            state,
            services,
            replies: Vec::new(),
        }
    }

    pub fn reply(&mut self, response: OutboundResponse) {
        self.replies.push(response);
    }

    pub fn reply_text(&mut self, text: impl Into<String>) {
        self.replies.push(OutboundResponse::Text(text.into()));
    }

    pub fn has_replies(&self) -> bool {
        !self.replies.is_empty()
    }

    pub fn take_replies(&mut self) -> Vec<OutboundResponse> {
        std::mem::take(&mut self.replies)
    }
}

/// A capability module. Every hook defaults to a no-op.
#[async_trait::async_trait]
pub trait Extension: Send + Sync {
    fn descriptor(&self) -> &ModuleDescriptor;

    /// Command-surface contributions, merged in module order.
    fn commands(&self, _config: &Config) -> Vec<CommandContribution> {
        Vec::new()
    }

    async fn on_init(&self, _services: &Services) -> Result<()> {
        Ok(())
    }

    async fn on_ready(&self, _services: &Services) -> Result<()> {
        Ok(())
    }

    async fn on_message(
        &self,
        _ctx: &mut HookContext<'_>,
        _message: &InboundMessage,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_message_updated(
        &self,
        _ctx: &mut HookContext<'_>,
        _message: &InboundMessage,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_reaction(&self, _ctx: &mut HookContext<'_>, _reaction: &ReactionEvent) -> Result<()> {
        Ok(())
    }

    /// Returns whether this module handled the command.
    async fn on_command(
        &self,
        _ctx: &mut HookContext<'_>,
        _command: &CommandInvocation,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Returns whether this module handled the interaction.
    async fn on_interaction(
        &self,
        _ctx: &mut HookContext<'_>,
        _interaction: &InteractionEvent,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Extra prompt context for the live turn.
    async fn gather_context(
        &self,
        _ctx: &mut HookContext<'_>,
        _message: &InboundMessage,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}
