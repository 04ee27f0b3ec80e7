//! Built-in modules and the manifest factory table.

use crate::config::Config;
use crate::conversation::history::Turn;
use crate::error::{ExtensionError, Result};
use crate::extensions::commands::{CommandContribution, CommandSpec};
use crate::extensions::registry::{ExtensionFactory, Manifest};
use crate::extensions::traits::{Extension, Hook, HookContext, ModuleDescriptor};
use crate::memory::factoids::{self, LearnOutcome, LearnedFact};
use crate::memory::types::FactoidProvenance;
use crate::state::types::ConversationState;
use crate::{CommandInvocation, InboundMessage, OutboundResponse};

use serde::Deserialize;
use std::sync::Arc;

/// Kinds a manifest may name.
pub const FACTORIES: &[(&str, ExtensionFactory)] = &[
    ("options", options_from_manifest),
    ("factoids", factoids_from_manifest),
    ("clock", clock_from_manifest),
    ("static_context", static_context_from_manifest),
    ("keyword_react", keyword_react_from_manifest),
];

type Built = std::result::Result<Arc<dyn Extension>, ExtensionError>;

fn options_from_manifest(manifest: &Manifest) -> Built {
    Ok(Arc::new(OptionsExtension::new(descriptor_from(manifest))))
}

fn factoids_from_manifest(manifest: &Manifest) -> Built {
    Ok(Arc::new(FactoidsExtension::new(descriptor_from(manifest))))
}

fn clock_from_manifest(manifest: &Manifest) -> Built {
    Ok(Arc::new(ClockExtension::new(descriptor_from(manifest))))
}

fn static_context_from_manifest(manifest: &Manifest) -> Built {
    let settings = manifest.settings()?;
    Ok(Arc::new(StaticContextExtension::new(descriptor_from(manifest), settings)))
}

fn keyword_react_from_manifest(manifest: &Manifest) -> Built {
    let settings = manifest.settings()?;
    Ok(Arc::new(KeywordReactExtension::new(descriptor_from(manifest), settings)?))
}

fn descriptor_from(manifest: &Manifest) -> ModuleDescriptor {
    ModuleDescriptor::new(&manifest.id, manifest.display_name())
        .depends_on(manifest.dependencies.iter().cloned())
}

/// Modules registered on every boot, ahead of anything discovered.
pub fn default_modules() -> Vec<Arc<dyn Extension>> {
    vec![
        Arc::new(OptionsExtension::new(ModuleDescriptor::new("options", "Options"))),
        Arc::new(FactoidsExtension::new(
            ModuleDescriptor::new("factoids", "Factoids").depends_on(["options"]),
        )),
        Arc::new(ClockExtension::new(ModuleDescriptor::new("clock", "Clock"))),
    ]
}

fn addressed<'c>(command: &'c CommandInvocation, config: &Config) -> Option<&'c str> {
    if command.name != config.bot.command_name {
        return None;
    }
    command.subcommand.as_deref()
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

// --- options ---

/// Per-conversation switches and sticky instructions.
pub struct OptionsExtension {
    descriptor: ModuleDescriptor,
}

impl OptionsExtension {
    pub fn new(descriptor: ModuleDescriptor) -> Self {
        Self {
            descriptor: descriptor.with_hooks([Hook::Command]),
        }
    }
}

/// Apply an options subcommand. None when the subcommand isn't ours.
///
/// Malformed input yields an explanatory reply and leaves the state untouched.
pub fn apply_option(state: &mut ConversationState, subcommand: &str, args: &[String]) -> Option<String> {
    let reply = match subcommand {
        "enable" => {
            state.options.enabled = true;
            "Enabled in this conversation.".to_string()
        }
        "disable" => {
            state.options.enabled = false;
            "Disabled in this conversation. Commands still work.".to_string()
        }
        "mute" => {
            state.options.muted = true;
            "Muted. I'll keep listening and learning but won't reply.".to_string()
        }
        "unmute" => {
            state.options.muted = false;
            "Unmuted.".to_string()
        }
        "learning" => match args.first().map(|a| a.to_lowercase()).as_deref() {
            Some("on") => {
                state.options.learning_enabled = true;
                "Learning enabled.".to_string()
            }
            Some("off") => {
                state.options.learning_enabled = false;
                "Learning disabled.".to_string()
            }
            _ => "Usage: learning on|off".to_string(),
        },
        "threshold" => match args.first().map(|a| a.parse::<f32>()) {
            Some(Ok(value)) if value.is_finite() && (0.0..=1.0).contains(&value) => {
                state.options.similarity_threshold = value;
                format!("Similarity threshold set to {value:.2}.")
            }
            _ => "Threshold must be a number between 0 and 1.".to_string(),
        },
        "instruct" => {
            let text = args.join(" ");
            let text = text.trim();
            if text.is_empty() {
                "Usage: instruct <text>".to_string()
            } else {
                state.instructions.push(Turn::system(text));
                format!("Instruction added ({} total).", state.instructions.len())
            }
        }
        "instructions" => match args.first().map(String::as_str) {
            Some("clear") => {
                let count = state.instructions.len();
                state.instructions.clear();
                format!("Cleared {count} instruction(s).")
            }
            None | Some("list") => {
                if state.instructions.is_empty() {
                    "No instructions set.".to_string()
                } else {
                    state
                        .instructions
                        .iter()
                        .enumerate()
                        .map(|(i, turn)| format!("{}. {}", i + 1, turn.content))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            Some(_) => "Usage: instructions [list|clear]".to_string(),
        },
        "status" => {
            let options = &state.options;
            format!(
                "Enabled: {} | Muted: {} | Learning: {} | Threshold: {:.2}\n\
                 History: {} turns ({}/{} chars) | Instructions: {} | Factoids: {} | Chunks: {}",
                yes_no(options.enabled),
                yes_no(options.muted),
                if options.learning_enabled { "on" } else { "off" },
                options.similarity_threshold,
                state.history.len(),
                state.history.length(),
                state.history.max_length(),
                state.instructions.len(),
                state.factoids.len(),
                state.chunks().count(),
            )
        }
        _ => return None,
    };
    Some(reply)
}

#[async_trait::async_trait]
impl Extension for OptionsExtension {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn commands(&self, config: &Config) -> Vec<CommandContribution> {
        let group = CommandSpec::new(
            config.bot.command_name.clone(),
            format!("{} settings", config.bot.display_name),
        )
        .subcommand(CommandSpec::new("enable", "Reply in this conversation"))
        .subcommand(CommandSpec::new("disable", "Ignore this conversation"))
        .subcommand(CommandSpec::new("mute", "Listen and learn without replying"))
        .subcommand(CommandSpec::new("unmute", "Resume replying"))
        .subcommand(CommandSpec::new("learning", "Toggle learning").usage("on|off"))
        .subcommand(CommandSpec::new("threshold", "Set retrieval similarity threshold").usage("<0..1>"))
        .subcommand(CommandSpec::new("status", "Show conversation settings"))
        .subcommand(CommandSpec::new("instruct", "Add a sticky instruction").usage("<text>"))
        .subcommand(CommandSpec::new("instructions", "List or clear instructions").usage("[list|clear]"));
        vec![CommandContribution::TopLevel(group)]
    }

    async fn on_command(&self, ctx: &mut HookContext<'_>, command: &CommandInvocation) -> Result<bool> {
        let Some(subcommand) = addressed(command, &ctx.services.config) else {
            return Ok(false);
        };
        let Some(reply) = apply_option(ctx.state, subcommand, &command.args) else {
            return Ok(false);
        };
        tracing::info!(
            conversation_id = %ctx.conversation.conversation_id,
            subcommand,
            "options command"
        );
        ctx.reply_text(reply);
        Ok(true)
    }
}

// --- factoids ---

/// Learning, forgetting and listing factoids.
pub struct FactoidsExtension {
    descriptor: ModuleDescriptor,
}

impl FactoidsExtension {
    pub fn new(descriptor: ModuleDescriptor) -> Self {
        Self {
            descriptor: descriptor.with_hooks([Hook::Message, Hook::Command]),
        }
    }

    async fn learn(
        &self,
        ctx: &mut HookContext<'_>,
        learned: &LearnedFact,
        supplier_id: &str,
        supplier_name: &str,
        message_id: &str,
    ) -> Option<LearnOutcome> {
        let embedding = match ctx
            .services
            .embedder
            .embed(&format!("{} {}", learned.term, learned.fact))
            .await
        {
            Ok(embedding) => embedding,
            Err(error) => {
                tracing::warn!(%error, "factoid embedding failed, storing for exact match only");
                Vec::new()
            }
        };
        let provenance = FactoidProvenance {
            supplier_id: supplier_id.to_string(),
            supplier_name: supplier_name.to_string(),
            community_id: ctx.conversation.community_id.to_string(),
            conversation_id: ctx.conversation.conversation_id.to_string(),
            message_id: message_id.to_string(),
        };
        factoids::learn(ctx.state, learned, embedding, provenance)
    }
}

#[async_trait::async_trait]
impl Extension for FactoidsExtension {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn commands(&self, config: &Config) -> Vec<CommandContribution> {
        let group = config.bot.command_name.clone();
        [
            CommandSpec::new("learn", "Teach a factoid").usage("<term> is <fact>"),
            CommandSpec::new("forget", "Forget a factoid").usage("<term>"),
            CommandSpec::new("factoids", "List known factoids"),
            CommandSpec::new("factoid-stats", "Show factoid match statistics"),
        ]
        .into_iter()
        .map(|command| CommandContribution::IntoGroup {
            group: group.clone(),
            command,
        })
        .collect()
    }

    async fn on_message(&self, ctx: &mut HookContext<'_>, message: &InboundMessage) -> Result<()> {
        if message.author.is_bot || !ctx.state.options.learning_enabled {
            return Ok(());
        }
        let Some(learned) = factoids::parse_learn_statement(&message.content) else {
            return Ok(());
        };
        if self
            .learn(
                ctx,
                &learned,
                &message.author.id,
                &message.author.display_name,
                &message.id,
            )
            .await
            .is_some()
        {
            ctx.reply(OutboundResponse::Reaction("✅".into()));
        }
        Ok(())
    }

    async fn on_command(&self, ctx: &mut HookContext<'_>, command: &CommandInvocation) -> Result<bool> {
        let Some(subcommand) = addressed(command, &ctx.services.config) else {
            return Ok(false);
        };
        let argument = command.args.join(" ");

        let reply = match subcommand {
            "learn" => match factoids::parse_definition(&argument) {
                Some(learned) => {
                    match self
                        .learn(
                            ctx,
                            &learned,
                            &command.author.id,
                            &command.author.display_name,
                            &command.id,
                        )
                        .await
                    {
                        Some(LearnOutcome::Created) => format!("Learned **{}**.", learned.term),
                        Some(LearnOutcome::Replaced) => format!("Updated **{}**.", learned.term),
                        None => "That term is empty after normalization.".to_string(),
                    }
                }
                None => "Usage: learn <term> is <fact>".to_string(),
            },
            "forget" => {
                if argument.trim().is_empty() {
                    "Usage: forget <term>".to_string()
                } else {
                    match factoids::forget(ctx.state, &argument) {
                        Some(factoid) => format!("Forgot **{}**.", factoid.term),
                        None => format!("I don't know anything about **{}**.", argument.trim()),
                    }
                }
            }
            "factoids" => {
                if ctx.state.factoids.is_empty() {
                    "No factoids yet.".to_string()
                } else {
                    let terms: Vec<&str> = ctx.state.factoids.keys().map(String::as_str).collect();
                    format!("Known factoids: {}", terms.join(", "))
                }
            }
            "factoid-stats" => {
                let stats = &ctx.state.match_stats;
                let mut top: Vec<(&String, &u64)> = stats.per_term.iter().collect();
                top.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
                let top: Vec<String> = top
                    .into_iter()
                    .take(5)
                    .map(|(term, count)| format!("{term} ({count})"))
                    .collect();
                format!(
                    "Factoid matches: {} total{}",
                    stats.total_matches,
                    if top.is_empty() {
                        String::new()
                    } else {
                        format!(" | top: {}", top.join(", "))
                    }
                )
            }
            _ => return Ok(false),
        };

        ctx.reply_text(reply);
        Ok(true)
    }
}

// --- clock ---

/// Adds the current time to every prompt.
pub struct ClockExtension {
    descriptor: ModuleDescriptor,
}

impl ClockExtension {
    pub fn new(descriptor: ModuleDescriptor) -> Self {
        Self {
            descriptor: descriptor.with_hooks([Hook::GatherContext]),
        }
    }
}

#[async_trait::async_trait]
impl Extension for ClockExtension {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn gather_context(
        &self,
        _ctx: &mut HookContext<'_>,
        _message: &InboundMessage,
    ) -> Result<Option<String>> {
        let now = chrono::Utc::now();
        Ok(Some(format!(
            "Current date and time: {} UTC",
            now.format("%A, %Y-%m-%d %H:%M")
        )))
    }
}

// --- static_context ---

#[derive(Debug, Clone, Deserialize)]
pub struct StaticContextSettings {
    pub text: String,
    /// Conversation ids to apply to. Empty means all.
    #[serde(default)]
    pub conversations: Vec<String>,
}

/// Fixed text appended to prompts, optionally only in some conversations.
pub struct StaticContextExtension {
    descriptor: ModuleDescriptor,
    settings: StaticContextSettings,
}

impl StaticContextExtension {
    pub fn new(descriptor: ModuleDescriptor, settings: StaticContextSettings) -> Self {
        Self {
            descriptor: descriptor.with_hooks([Hook::GatherContext]),
            settings,
        }
    }
}

#[async_trait::async_trait]
impl Extension for StaticContextExtension {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn gather_context(
        &self,
        ctx: &mut HookContext<'_>,
        _message: &InboundMessage,
    ) -> Result<Option<String>> {
        let applies = self.settings.conversations.is_empty()
            || self
                .settings
                .conversations
                .iter()
                .any(|id| **id == *ctx.conversation.conversation_id);
        Ok(applies.then(|| self.settings.text.clone()))
    }
}

// --- keyword_react ---

#[derive(Debug, Clone, Deserialize)]
pub struct KeywordReactSettings {
    pub keywords: Vec<String>,
    pub emoji: String,
}

/// Reacts to messages mentioning any configured keyword.
pub struct KeywordReactExtension {
    descriptor: ModuleDescriptor,
    keywords: Vec<String>,
    emoji: String,
}

impl KeywordReactExtension {
    pub fn new(
        descriptor: ModuleDescriptor,
        settings: KeywordReactSettings,
    ) -> std::result::Result<Self, ExtensionError> {
        let keywords: Vec<String> = settings
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() || settings.emoji.trim().is_empty() {
            return Err(ExtensionError::InvalidSettings {
                id: descriptor.id.clone(),
                message: "keywords and emoji are required".into(),
            });
        }
        Ok(Self {
            descriptor: descriptor.with_hooks([Hook::Message]),
            keywords,
            emoji: settings.emoji.trim().to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Extension for KeywordReactExtension {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn on_message(&self, ctx: &mut HookContext<'_>, message: &InboundMessage) -> Result<()> {
        let content = message.content.to_lowercase();
        if self.keywords.iter().any(|k| content.contains(k.as_str())) {
            ctx.reply(OutboundResponse::Reaction(self.emoji.clone()));
        }
        Ok(())
    }
}
