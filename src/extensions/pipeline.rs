//! Failure-isolated fan-out over the active modules, in dependency order.

use crate::config::Config;
use crate::error::{ExtensionError, Result};
use crate::extensions::commands::CommandSurface;
use crate::extensions::traits::{Extension, Hook, HookContext, Services};
use crate::{CommandInvocation, InboundMessage, InteractionEvent, ReactionEvent};

use futures::FutureExt as _;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Run one module hook, containing errors and panics to that module.
async fn guarded<T>(
    id: &str,
    hook: Hook,
    future: impl Future<Output = Result<T>>,
) -> Option<T> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(error)) => {
            let error = ExtensionError::HookFailed {
                id: id.to_string(),
                hook: hook.as_str(),
                message: error.to_string(),
            };
            tracing::warn!(%error, extension = %id, hook = hook.as_str(), "extension hook failed");
            None
        }
        Err(_) => {
            let error = ExtensionError::Panicked {
                id: id.to_string(),
                hook: hook.as_str(),
            };
            tracing::error!(%error, extension = %id, hook = hook.as_str(), "extension hook panicked");
            None
        }
    }
}

/// The active modules and their merged command surface.
pub struct ExtensionPipeline {
    modules: Vec<Arc<dyn Extension>>,
    surface: CommandSurface,
}

impl ExtensionPipeline {
    /// Build from modules already in dependency order.
    pub fn new(modules: Vec<Arc<dyn Extension>>, config: &Config) -> Self {
        let mut surface = CommandSurface::new();
        for module in &modules {
            surface.merge_all(&module.descriptor().id, module.commands(config));
        }
        Self { modules, surface }
    }

    pub fn empty() -> Self {
        Self {
            modules: Vec::new(),
            surface: CommandSurface::new(),
        }
    }

    pub fn ids(&self) -> Vec<&str> {
        self.modules
            .iter()
            .map(|m| m.descriptor().id.as_str())
            .collect()
    }

    pub fn command_surface(&self) -> &CommandSurface {
        &self.surface
    }

    fn implementing(&self, hook: Hook) -> impl Iterator<Item = &Arc<dyn Extension>> {
        self.modules
            .iter()
            .filter(move |m| m.descriptor().implements(hook))
    }

    pub async fn init(&self, services: &Services) {
        for module in self.implementing(Hook::Init) {
            guarded(&module.descriptor().id, Hook::Init, module.on_init(services)).await;
        }
    }

    pub async fn ready(&self, services: &Services) {
        for module in self.implementing(Hook::Ready) {
            guarded(&module.descriptor().id, Hook::Ready, module.on_ready(services)).await;
        }
    }

    pub async fn message(&self, ctx: &mut HookContext<'_>, message: &InboundMessage) {
        for module in self.implementing(Hook::Message) {
            guarded(
                &module.descriptor().id,
                Hook::Message,
                module.on_message(ctx, message),
            )
            .await;
        }
    }

    pub async fn message_updated(&self, ctx: &mut HookContext<'_>, message: &InboundMessage) {
        for module in self.implementing(Hook::MessageUpdated) {
            guarded(
                &module.descriptor().id,
                Hook::MessageUpdated,
                module.on_message_updated(ctx, message),
            )
            .await;
        }
    }

    pub async fn reaction(&self, ctx: &mut HookContext<'_>, reaction: &ReactionEvent) {
        for module in self.implementing(Hook::Reaction) {
            guarded(
                &module.descriptor().id,
                Hook::Reaction,
                module.on_reaction(ctx, reaction),
            )
            .await;
        }
    }

    /// Every module runs; handled if any module reports handled.
    pub async fn command(&self, ctx: &mut HookContext<'_>, command: &CommandInvocation) -> bool {
        let mut handled = false;
        for module in self.implementing(Hook::Command) {
            if guarded(
                &module.descriptor().id,
                Hook::Command,
                module.on_command(ctx, command),
            )
            .await
            .unwrap_or(false)
            {
                handled = true;
            }
        }
        handled
    }

    /// Every module runs; handled if any module reports handled.
    pub async fn interaction(
        &self,
        ctx: &mut HookContext<'_>,
        interaction: &InteractionEvent,
    ) -> bool {
        let mut handled = false;
        for module in self.implementing(Hook::Interaction) {
            if guarded(
                &module.descriptor().id,
                Hook::Interaction,
                module.on_interaction(ctx, interaction),
            )
            .await
            .unwrap_or(false)
            {
                handled = true;
            }
        }
        handled
    }

    /// Extra prompt context from every module, in module order.
    pub async fn gather_context(
        &self,
        ctx: &mut HookContext<'_>,
        message: &InboundMessage,
    ) -> Vec<String> {
        let mut contexts = Vec::new();
        for module in self.implementing(Hook::GatherContext) {
            if let Some(Some(context)) = guarded(
                &module.descriptor().id,
                Hook::GatherContext,
                module.gather_context(ctx, message),
            )
            .await
            {
                let context = context.trim();
                if !context.is_empty() {
                    contexts.push(context.to_string());
                }
            }
        }
        contexts
    }
}
