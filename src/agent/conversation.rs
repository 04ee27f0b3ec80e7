//! Per-event control flow and per-conversation scheduling.
//!
//! Each conversation gets its own worker task fed by a mailbox, so its events
//! run strictly one after another while different conversations proceed
//! concurrently. Within a turn the state handle's mutex is held throughout.
//! A worker exits after a quiet period and is restarted by its next event.

use crate::config::Config;
use crate::conversation::history::Turn;
use crate::conversation::prompt::{self, PromptInputs};
use crate::delivery::assembler::{self, AssembledReply, FilePayload};
use crate::extensions::pipeline::ExtensionPipeline;
use crate::extensions::traits::{HookContext, Services};
use crate::llm::model::LanguageModel;
use crate::memory::factoids;
use crate::memory::images::{self, ImageSelection};
use crate::memory::ingest::{self, AttachmentOrigin, AttachmentSource};
use crate::memory::search::{self, RetrievedContext};
use crate::messaging::traits::{InboundStream, MessagingDyn};
use crate::state::store::StateStore;
use crate::state::types::ConversationState;
use crate::{
    CommandInvocation, ConversationId, InboundEvent, InboundMessage, InteractionEvent,
    OutboundResponse, ReactionEvent, ReplyTarget, StatusUpdate,
};

use futures::StreamExt as _;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

const DEFAULT_WORKER_IDLE: Duration = Duration::from_secs(300);

type Mailbox = mpsc::UnboundedSender<InboundEvent>;

const VISION_PROMPT: &str = "Describe this image in two or three sentences for someone who cannot \
    see it. Mention any visible text verbatim.";

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Not processed: bot author, disabled conversation, or identity refusal.
    Ignored,
    /// Extensions ran; no model call was needed.
    Observed,
    /// Answered from a stored factoid without calling the model.
    FactoidReply,
    /// Recorded but not answered because the conversation is muted.
    Muted,
    /// The model answered and this many deliveries were sent.
    Replied { deliveries: usize },
    /// The model call failed or produced nothing.
    Failed,
    /// A command or interaction, and whether any module claimed it.
    Handled(bool),
}

/// Everything a turn needs, shared by every conversation worker.
pub struct ConversationEngine {
    config: Arc<Config>,
    store: Arc<StateStore>,
    pipeline: Arc<ExtensionPipeline>,
    services: Services,
    model: Arc<dyn LanguageModel>,
    attachments: Arc<dyn AttachmentSource>,
    messaging: Arc<dyn MessagingDyn>,
    worker_idle: Duration,
}

impl ConversationEngine {
    pub fn new(
        config: Arc<Config>,
        store: Arc<StateStore>,
        pipeline: Arc<ExtensionPipeline>,
        services: Services,
        model: Arc<dyn LanguageModel>,
        attachments: Arc<dyn AttachmentSource>,
        messaging: Arc<dyn MessagingDyn>,
    ) -> Self {
        Self {
            config,
            store,
            pipeline,
            services,
            model,
            attachments,
            messaging,
            worker_idle: DEFAULT_WORKER_IDLE,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Run module init, publish the command surface, then signal ready.
    pub async fn start(&self) {
        self.pipeline.init(&self.services).await;
        if let Err(error) = self
            .messaging
            .register_commands(self.pipeline.command_surface())
            .await
        {
            tracing::warn!(%error, "failed to register commands");
        }
        self.pipeline.ready(&self.services).await;
        tracing::info!(
            extensions = ?self.pipeline.ids(),
            adapter = self.messaging.name(),
            "conversation engine ready"
        );
    }

    /// How long a conversation worker waits for its next event before exiting.
    pub fn with_worker_idle(mut self, idle: Duration) -> Self {
        self.worker_idle = idle;
        self
    }

    /// Route events to per-conversation workers until the stream ends or
    /// `shutdown` resolves, then save every conversation.
    ///
    /// On shutdown, in-flight turns are abandoned before the final save.
    pub async fn run(self: Arc<Self>, mut events: InboundStream, shutdown: impl Future<Output = ()>) {
        let mut mailboxes: HashMap<ConversationId, Mailbox> = HashMap::new();
        let mut workers: JoinSet<ConversationId> = JoinSet::new();
        tokio::pin!(shutdown);

        let interrupted = loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => self.dispatch(&mut mailboxes, &mut workers, event),
                    None => {
                        tracing::info!("inbound stream ended");
                        break false;
                    }
                },
                Some(result) = workers.join_next(), if !workers.is_empty() => match result {
                    Ok(conversation_id) => {
                        if mailboxes
                            .get(&conversation_id)
                            .is_some_and(|mailbox| mailbox.is_closed())
                        {
                            mailboxes.remove(&conversation_id);
                        }
                    }
                    Err(error) if error.is_panic() => {
                        tracing::error!(%error, "conversation worker panicked");
                    }
                    Err(_) => {}
                },
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received");
                    break true;
                }
            }
        };

        drop(mailboxes);
        if interrupted {
            workers.abort_all();
        }
        while workers.join_next().await.is_some() {}

        let failures = self.store.save_all().await;
        if failures > 0 {
            tracing::warn!(failures, "some conversations failed to save on shutdown");
        }
    }

    /// Hand an event to its conversation's worker without waiting on it.
    fn dispatch(
        self: &Arc<Self>,
        mailboxes: &mut HashMap<ConversationId, Mailbox>,
        workers: &mut JoinSet<ConversationId>,
        event: InboundEvent,
    ) {
        let conversation_id = event.conversation().conversation_id.clone();

        let event = match mailboxes.get(&conversation_id) {
            Some(mailbox) => match mailbox.send(event) {
                Ok(()) => return,
                // Worker went idle or died; start a new one below.
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        if sender.send(event).is_err() {
            tracing::error!(%conversation_id, "conversation mailbox closed before start, event dropped");
            return;
        }
        workers.spawn(self.clone().work(conversation_id.clone(), receiver));
        mailboxes.insert(conversation_id, sender);
    }

    async fn work(
        self: Arc<Self>,
        conversation_id: ConversationId,
        mut receiver: mpsc::UnboundedReceiver<InboundEvent>,
    ) -> ConversationId {
        loop {
            match tokio::time::timeout(self.worker_idle, receiver.recv()).await {
                Ok(Some(event)) => {
                    self.handle_event(event).await;
                }
                Ok(None) => break,
                Err(_) => {
                    // Refuse new events, then finish whatever was already queued.
                    receiver.close();
                    while let Some(event) = receiver.recv().await {
                        self.handle_event(event).await;
                    }
                    tracing::debug!(%conversation_id, "conversation worker idle, exiting");
                    break;
                }
            }
        }
        conversation_id
    }

    /// Process one event to completion and persist the conversation.
    pub async fn handle_event(&self, event: InboundEvent) -> TurnOutcome {
        let conversation = event.conversation().clone();
        let handle = match self.store.get_or_create(&conversation).await {
            Ok(handle) => handle,
            Err(error) => {
                tracing::warn!(%error, "refusing event for conversation with conflicting identity");
                return TurnOutcome::Ignored;
            }
        };

        let mut state = handle.lock().await;
        if let Err(error) = state.identity.bind(&conversation) {
            tracing::warn!(%error, "refusing event for conversation with conflicting identity");
            return TurnOutcome::Ignored;
        }

        let outcome = match &event {
            InboundEvent::Message(message) => self.handle_message(&mut state, message).await,
            InboundEvent::MessageUpdated(message) => {
                self.handle_message_updated(&mut state, message).await
            }
            InboundEvent::ReactionAdded(reaction) => self.handle_reaction(&mut state, reaction).await,
            InboundEvent::Command(command) => self.handle_command(&mut state, command).await,
            InboundEvent::Interaction(interaction) => {
                self.handle_interaction(&mut state, interaction).await
            }
        };

        if let Err(error) = self.store.save(&mut state).await {
            tracing::error!(
                %error,
                conversation_id = %conversation.conversation_id,
                "failed to save conversation state"
            );
        }

        tracing::debug!(
            conversation_id = %conversation.conversation_id,
            ?outcome,
            "event processed"
        );
        outcome
    }

    async fn handle_message(
        &self,
        state: &mut ConversationState,
        message: &InboundMessage,
    ) -> TurnOutcome {
        if message.author.is_bot {
            return TurnOutcome::Ignored;
        }
        let target = ReplyTarget::message(&message.conversation, &message.id);

        if !state.options.enabled {
            let mut ctx = HookContext::new(&message.conversation, state, &self.services);
            self.pipeline.message(&mut ctx, message).await;
            return TurnOutcome::Ignored;
        }

        if state.options.learning_enabled {
            self.ingest(state, message).await;
        }

        let live = Turn::user(&message.author.display_name, &message.content).with_message_id(&message.id);
        state.history.add_turn(live.clone());

        let replies = {
            let mut ctx = HookContext::new(&message.conversation, state, &self.services);
            self.pipeline.message(&mut ctx, message).await;
            ctx.take_replies()
        };
        let muted = state.options.muted;
        if !muted {
            self.send_replies(&target, replies).await;
        }

        if let Some(factoid) = factoids::lookup(state, &message.content).cloned() {
            let entry = factoids::record_match(state, &factoid.term, &message.author.id, &message.id);
            if let Err(error) = self.store.append_match_log(state, &entry).await {
                tracing::warn!(%error, term = %factoid.term, "failed to append factoid match log");
            }
            if muted {
                return TurnOutcome::Muted;
            }

            let permalink = self.config.permalink(
                &factoid.provenance.community_id,
                &factoid.provenance.conversation_id,
                &factoid.provenance.message_id,
            );
            let text = match factoids::provenance_reply(&factoid, &permalink) {
                Ok(text) => text,
                Err(error) => {
                    tracing::warn!(%error, "failed to render factoid reply");
                    format!("**{}** {}", factoid.term, factoid.fact)
                }
            };
            state.history.add_turn(Turn::assistant(&text));
            let deliveries = assembler::plan_deliveries(
                AssembledReply {
                    text,
                    files: Vec::new(),
                },
                &self.config.delivery,
            );
            self.deliver(&target, deliveries).await;
            return TurnOutcome::FactoidReply;
        }

        if muted {
            return TurnOutcome::Muted;
        }

        let query = match self.services.embedder.embed(&message.content).await {
            Ok(query) => Some(query),
            Err(error) => {
                tracing::warn!(%error, "query embedding failed, continuing without retrieval");
                None
            }
        };
        let retrieved = match &query {
            Some(query) => search::retrieve(
                state,
                query,
                self.config.retrieval.match_limit,
                Some(&message.id),
            ),
            None => RetrievedContext::default(),
        };

        let mut selection = images::select_images(state, message, query.as_deref());
        if let Some(selection) = &mut selection {
            self.refresh_descriptions(state, selection).await;
        }

        let contexts = {
            let mut ctx = HookContext::new(&message.conversation, state, &self.services);
            self.pipeline.gather_context(&mut ctx, message).await
        };

        let messages = match prompt::compose(&PromptInputs {
            prime_directive: &self.config.bot.prime_directive,
            state,
            live: &live,
            retrieved: &retrieved,
            images: selection.as_ref(),
            extension_contexts: &contexts,
        }) {
            Ok(messages) => messages,
            Err(error) => {
                tracing::error!(%error, "failed to compose prompt");
                return TurnOutcome::Failed;
            }
        };

        self.status(&target, StatusUpdate::Typing).await;
        let outcome = self
            .complete(state, &target, messages, selection.as_ref())
            .await;
        self.status(&target, StatusUpdate::StopTyping).await;
        outcome
    }

    async fn complete(
        &self,
        state: &mut ConversationState,
        target: &ReplyTarget,
        messages: Vec<crate::llm::model::ChatMessage>,
        selection: Option<&ImageSelection>,
    ) -> TurnOutcome {
        let stream = match self.model.stream_chat(messages).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(%error, "chat completion failed");
                return TurnOutcome::Failed;
            }
        };

        let aggregated = assembler::aggregate(stream).await;
        if let Some(error) = &aggregated.error {
            tracing::warn!(
                %error,
                partial_chars = aggregated.text.chars().count(),
                "chat stream failed midway"
            );
        }

        let mut reply = assembler::extract_files(&aggregated.text);
        if reply.is_empty() {
            return TurnOutcome::Failed;
        }
        if !reply.text.is_empty() {
            state.history.add_turn(Turn::assistant(&reply.text));
        }

        if let Some(selection) = selection.filter(|s| s.reattach()) {
            for image in selection.chunks.iter().filter_map(|c| c.image.as_ref()) {
                match FilePayload::read(&image.path, &image.filename).await {
                    Ok(file) => reply.files.push(file),
                    Err(error) => tracing::warn!(%error, "failed to re-attach image"),
                }
            }
        }

        let deliveries = assembler::plan_deliveries(reply, &self.config.delivery);
        let sent = self.deliver(target, deliveries).await;
        TurnOutcome::Replied { deliveries: sent }
    }

    /// Ingest the message text and any attachments, including those on the
    /// replied-to message. Failures are logged and skipped.
    async fn ingest(&self, state: &mut ConversationState, message: &InboundMessage) {
        let retrieval = &self.config.retrieval;
        if let Err(error) = ingest::ingest_message(
            state,
            self.services.embedder.as_ref(),
            message,
            retrieval.chunk_chars,
            retrieval.min_ingest_chars,
        )
        .await
        {
            tracing::warn!(%error, message_id = %message.id, "failed to ingest message text");
        }

        let own = message
            .attachments
            .iter()
            .map(|attachment| (AttachmentOrigin::message(message), attachment));
        let replied = message.reply_to.iter().flat_map(|reply| {
            reply
                .attachments
                .iter()
                .map(move |attachment| (AttachmentOrigin::replied_to(message, reply), attachment))
        });
        let attachments: Vec<_> = own.chain(replied).collect();
        if attachments.is_empty() {
            return;
        }

        let dir = match self.store.attachments_dir(state) {
            Ok(dir) => dir,
            Err(error) => {
                tracing::warn!(%error, "no attachment directory for conversation");
                return;
            }
        };
        for (origin, attachment) in attachments {
            if let Err(error) = ingest::ingest_attachment(
                state,
                self.services.embedder.as_ref(),
                self.attachments.as_ref(),
                &dir,
                origin,
                attachment,
                retrieval.chunk_chars,
            )
            .await
            {
                tracing::warn!(%error, filename = %attachment.filename, "failed to ingest attachment");
            }
        }
    }

    /// Regenerate placeholder descriptions for the selected images.
    async fn refresh_descriptions(&self, state: &mut ConversationState, selection: &mut ImageSelection) {
        for chunk in selection.chunks.iter_mut() {
            let Some(image) = chunk.image.as_ref().filter(|image| images::is_stale(image)) else {
                continue;
            };
            let bytes = match tokio::fs::read(&image.path).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    tracing::warn!(%error, path = %image.path.display(), "failed to read stored image");
                    continue;
                }
            };
            let description = match self
                .model
                .describe_image(VISION_PROMPT, &bytes, &image.mime_type)
                .await
            {
                Ok(description) if !description.trim().is_empty() => description.trim().to_string(),
                Ok(_) => continue,
                Err(error) => {
                    tracing::warn!(%error, filename = %image.filename, "vision description failed");
                    continue;
                }
            };
            let embedding = self
                .services
                .embedder
                .embed(&format!("{}: {}", image.filename, description))
                .await
                .map_err(|error| tracing::warn!(%error, "failed to embed image description"))
                .ok();

            if images::apply_description(state, &chunk.id, &description, embedding)
                && let Some(updated) = state.chunks().find(|c| c.id == chunk.id)
            {
                *chunk = updated.clone();
                tracing::info!(filename = ?chunk.image.as_ref().map(|i| &i.filename), "image description regenerated");
            }
        }
    }

    async fn handle_message_updated(
        &self,
        state: &mut ConversationState,
        message: &InboundMessage,
    ) -> TurnOutcome {
        if message.author.is_bot || !state.options.enabled {
            return TurnOutcome::Ignored;
        }
        let muted = state.options.muted;
        let replies = {
            let mut ctx = HookContext::new(&message.conversation, state, &self.services);
            self.pipeline.message_updated(&mut ctx, message).await;
            ctx.take_replies()
        };
        if !muted {
            let target = ReplyTarget::message(&message.conversation, &message.id);
            self.send_replies(&target, replies).await;
        }
        TurnOutcome::Observed
    }

    async fn handle_reaction(&self, state: &mut ConversationState, reaction: &ReactionEvent) -> TurnOutcome {
        if !state.options.enabled {
            return TurnOutcome::Ignored;
        }
        let muted = state.options.muted;
        let replies = {
            let mut ctx = HookContext::new(&reaction.conversation, state, &self.services);
            self.pipeline.reaction(&mut ctx, reaction).await;
            ctx.take_replies()
        };
        if !muted {
            let target = ReplyTarget::message(&reaction.conversation, &reaction.message_id);
            self.send_replies(&target, replies).await;
        }
        TurnOutcome::Observed
    }

    /// Commands run even in disabled or muted conversations, so they can be
    /// switched back on.
    async fn handle_command(&self, state: &mut ConversationState, command: &CommandInvocation) -> TurnOutcome {
        let (handled, mut replies) = {
            let mut ctx = HookContext::new(&command.conversation, state, &self.services);
            let handled = self.pipeline.command(&mut ctx, command).await;
            (handled, ctx.take_replies())
        };
        if !handled && replies.is_empty() {
            tracing::debug!(name = %command.name, subcommand = ?command.subcommand, "unhandled command");
            replies.push(OutboundResponse::Text("Unknown command.".into()));
        }
        let target = ReplyTarget::message(&command.conversation, &command.id);
        self.send_replies(&target, replies).await;
        TurnOutcome::Handled(handled)
    }

    async fn handle_interaction(
        &self,
        state: &mut ConversationState,
        interaction: &InteractionEvent,
    ) -> TurnOutcome {
        let (handled, replies) = {
            let mut ctx = HookContext::new(&interaction.conversation, state, &self.services);
            let handled = self.pipeline.interaction(&mut ctx, interaction).await;
            (handled, ctx.take_replies())
        };
        let target = ReplyTarget::message(&interaction.conversation, &interaction.id);
        self.send_replies(&target, replies).await;
        TurnOutcome::Handled(handled)
    }

    /// Send queued extension replies. Text is split to the platform limit.
    async fn send_replies(&self, target: &ReplyTarget, replies: Vec<OutboundResponse>) {
        let mut deliveries = Vec::with_capacity(replies.len());
        for reply in replies {
            match reply {
                OutboundResponse::Text(text) => deliveries.extend(assembler::plan_deliveries(
                    AssembledReply {
                        text,
                        files: Vec::new(),
                    },
                    &self.config.delivery,
                )),
                other => deliveries.push(other),
            }
        }
        self.deliver(target, deliveries).await;
    }

    async fn deliver(&self, target: &ReplyTarget, deliveries: Vec<OutboundResponse>) -> usize {
        if deliveries.is_empty() {
            return 0;
        }
        let total = deliveries.len();
        match assembler::deliver(
            self.messaging.as_ref(),
            target,
            deliveries,
            Duration::from_millis(self.config.delivery.pacing_ms),
        )
        .await
        {
            Ok(sent) => sent,
            Err(error) => {
                tracing::warn!(%error, total, "delivery failed");
                0
            }
        }
    }

    async fn status(&self, target: &ReplyTarget, status: StatusUpdate) {
        if let Err(error) = self.messaging.send_status(target, status).await {
            tracing::debug!(%error, ?status, "failed to send status update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::builtin;
    use crate::memory::embedding::Embedder as _;
    use crate::memory::factoids::LearnedFact;
    use crate::memory::types::{Chunk, Document, FactoidProvenance, Provenance};
    use crate::state::types::StateDefaults;
    use crate::test_support::{
        FakeAttachments, FakeEmbedder, FakeMessaging, FakeModel, command, conversation_ref,
        inbound_message,
    };
    use crate::{Attachment, Author, ReplyReference};
    use futures::StreamExt as _;

    struct Harness {
        engine: ConversationEngine,
        model: Arc<FakeModel>,
        messaging: Arc<FakeMessaging>,
        _dir: tempfile::TempDir,
    }

    fn harness(fragments: &[&str]) -> Harness {
        harness_with(FakeModel::new(fragments), FakeAttachments::default())
    }

    fn harness_with(model: FakeModel, attachments: FakeAttachments) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.delivery.pacing_ms = 0;
        config.retrieval.min_ingest_chars = 1_000;
        let config = Arc::new(config);

        let store = Arc::new(StateStore::new(
            dir.path().join("conversations"),
            StateDefaults {
                history_max_chars: config.history.max_chars,
                similarity_threshold: config.retrieval.similarity_threshold,
            },
        ));
        let pipeline = Arc::new(ExtensionPipeline::new(builtin::default_modules(), &config));
        let services = Services {
            config: config.clone(),
            embedder: Arc::new(FakeEmbedder::default()),
        };
        let model = Arc::new(model);
        let messaging = Arc::new(FakeMessaging::default());

        let engine = ConversationEngine::new(
            config,
            store,
            pipeline,
            services,
            model.clone(),
            Arc::new(attachments),
            messaging.clone(),
        );
        Harness {
            engine,
            model,
            messaging,
            _dir: dir,
        }
    }

    fn image(id: &str, filename: &str) -> Attachment {
        Attachment {
            id: id.into(),
            filename: filename.into(),
            mime_type: String::new(),
            url: format!("https://cdn.example/{filename}"),
            size_bytes: None,
        }
    }

    fn in_conversation(mut message: InboundMessage, conversation_id: &str) -> InboundMessage {
        message.conversation.conversation_id = Arc::from(conversation_id);
        message
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn factoid_hit_skips_the_model() {
        let harness = harness(&["should never be used"]);
        let conversation = conversation_ref();
        let handle = harness
            .engine
            .store()
            .get_or_create(&conversation)
            .await
            .expect("create");
        {
            let mut state = handle.lock().await;
            factoids::learn(
                &mut state,
                &LearnedFact {
                    term: "foo".into(),
                    fact: "is a bar".into(),
                },
                vec![1.0, 0.0],
                FactoidProvenance {
                    supplier_id: "u2".into(),
                    supplier_name: "bob".into(),
                    community_id: conversation.community_id.to_string(),
                    conversation_id: conversation.conversation_id.to_string(),
                    message_id: "m0".into(),
                },
            );
        }

        let outcome = harness
            .engine
            .handle_event(InboundEvent::Message(inbound_message("m1", "The Foo?")))
            .await;

        assert_eq!(outcome, TurnOutcome::FactoidReply);
        assert_eq!(harness.model.calls(), 0);
        let sent = harness.messaging.sent();
        assert_eq!(sent.len(), 1);
        let OutboundResponse::Text(text) = &sent[0].1 else {
            panic!("expected text reply, got {:?}", sent[0].1);
        };
        assert!(text.contains("is a bar"));
        assert!(text.contains("bob"));
        assert!(text.contains("/m0"));

        let state = handle.lock().await;
        assert_eq!(state.match_stats.total_matches, 1);
        assert_eq!(state.match_stats.per_term.get("foo"), Some(&1));
    }

    #[tokio::test]
    async fn streamed_reply_is_assembled_and_delivered() {
        let harness = harness(&["Here ", "is your file.", "<file name=\"a.txt\">hello</file>"]);

        let outcome = harness
            .engine
            .handle_event(InboundEvent::Message(inbound_message("m1", "make me a file")))
            .await;

        assert_eq!(outcome, TurnOutcome::Replied { deliveries: 1 });
        assert_eq!(harness.model.calls(), 1);
        let sent = harness.messaging.sent();
        assert!(matches!(
            &sent[0].1,
            OutboundResponse::File { filename, caption: Some(caption), data, .. }
                if filename == "a.txt" && caption == "Here is your file." && data == b"hello"
        ));
        assert_eq!(
            harness.messaging.statuses(),
            vec![StatusUpdate::Typing, StatusUpdate::StopTyping]
        );

        let handle = harness
            .engine
            .store()
            .get(&conversation_ref().conversation_id)
            .await
            .expect("state exists");
        let state = handle.lock().await;
        let turns: Vec<&str> = state.history.turns().map(|t| t.content.as_str()).collect();
        assert_eq!(turns, vec!["make me a file", "Here is your file."]);
    }

    #[tokio::test]
    async fn muted_conversation_records_but_never_replies() {
        let harness = harness(&["unused"]);
        let muted = harness
            .engine
            .handle_event(InboundEvent::Command(command("chorus", Some("mute"), &[])))
            .await;
        assert_eq!(muted, TurnOutcome::Handled(true));

        let outcome = harness
            .engine
            .handle_event(InboundEvent::Message(inbound_message("m2", "anyone there?")))
            .await;
        assert_eq!(outcome, TurnOutcome::Muted);
        assert_eq!(harness.model.calls(), 0);
        // Only the command acknowledgement went out.
        assert_eq!(harness.messaging.sent().len(), 1);

        let handle = harness
            .engine
            .store()
            .get(&conversation_ref().conversation_id)
            .await
            .expect("state exists");
        assert_eq!(handle.lock().await.history.len(), 1);
    }

    #[tokio::test]
    async fn model_failure_is_a_failed_turn() {
        let harness = harness(&[]);
        let outcome = harness
            .engine
            .handle_event(InboundEvent::Message(inbound_message("m1", "hello?")))
            .await;
        assert_eq!(outcome, TurnOutcome::Failed);
        assert!(harness.messaging.sent().is_empty());
    }

    #[tokio::test]
    async fn conflicting_community_is_refused() {
        let harness = harness(&["hi"]);
        harness
            .engine
            .handle_event(InboundEvent::Message(inbound_message("m1", "hello")))
            .await;

        let mut foreign = inbound_message("m2", "hello again");
        foreign.conversation.community_id = Arc::from("999");
        let outcome = harness
            .engine
            .handle_event(InboundEvent::Message(foreign))
            .await;
        assert_eq!(outcome, TurnOutcome::Ignored);
        assert_eq!(harness.model.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_command_gets_a_reply() {
        let harness = harness(&[]);
        let outcome = harness
            .engine
            .handle_event(InboundEvent::Command(command("dice", None, &["2d6"])))
            .await;
        assert_eq!(outcome, TurnOutcome::Handled(false));
        assert_eq!(
            harness.messaging.sent()[0].1,
            OutboundResponse::Text("Unknown command.".into())
        );
    }

    #[tokio::test]
    async fn run_processes_stream_and_saves_on_exit() {
        let harness = harness(&["pong"]);
        let engine = Arc::new(harness.engine);
        let events: InboundStream = Box::pin(futures::stream::iter(vec![
            InboundEvent::Message(inbound_message("m1", "ping")),
            InboundEvent::Message(inbound_message("m2", "ping again")),
        ]));

        engine
            .clone()
            .run(events, std::future::pending::<()>())
            .await;

        assert_eq!(harness.model.calls(), 2);
        let handle = engine
            .store()
            .get(&conversation_ref().conversation_id)
            .await
            .expect("state exists");
        let state = handle.lock().await;
        assert_eq!(state.history.len(), 4);
        assert!(state.storage_dir.as_ref().is_some_and(|dir| dir.exists()));
    }

    #[tokio::test]
    async fn prompt_is_built_in_order_from_every_source() {
        let harness = harness(&["It's in the ops vault."]);
        let conversation = conversation_ref();
        let question = "where is the deploy key?";

        let handle = harness
            .engine
            .store()
            .get_or_create(&conversation)
            .await
            .expect("create");
        {
            let mut state = handle.lock().await;
            let embedding = FakeEmbedder.embed(question).await.expect("embed");
            let mut document = Document::new("msg-m0", None);
            document.chunks.push(Chunk::new(
                "the deploy key lives in the ops vault",
                embedding,
                Provenance {
                    community_id: "100".into(),
                    conversation_id: "chan-1".into(),
                    message_id: "m0".into(),
                    attachment_id: None,
                    author_id: Some("u2".into()),
                    author_name: Some("bob".into()),
                },
            ));
            state.put_document(document);
        }
        harness
            .engine
            .handle_event(InboundEvent::Command(command(
                "chorus",
                Some("instruct"),
                &["Answer", "in", "one", "line."],
            )))
            .await;

        let outcome = harness
            .engine
            .handle_event(InboundEvent::Message(inbound_message("m1", question)))
            .await;
        assert_eq!(outcome, TurnOutcome::Replied { deliveries: 1 });

        let prompts = harness.model.prompts();
        assert_eq!(prompts.len(), 1);
        let prompt = &prompts[0];
        let position = |needle: &str| {
            prompt
                .iter()
                .position(|m| m.content.contains(needle))
                .unwrap_or_else(|| panic!("{needle:?} missing from prompt"))
        };

        let directive = position("You are Chorus");
        let instruction = position("Answer in one line.");
        let retrieved = position("bob: the deploy key lives in the ops vault");
        let clock = position("Current date and time:");
        assert!(directive < instruction);
        assert!(instruction < retrieved);
        assert!(retrieved < clock);

        let live = prompt.last().expect("live turn");
        assert_eq!(live.content, "alice: where is the deploy key?");
        assert_eq!(
            prompt.iter().filter(|m| m.content.contains(question)).count(),
            1
        );
    }

    #[tokio::test]
    async fn attached_image_is_described_before_prompting() {
        let harness = harness_with(
            FakeModel::new(&["A cat."]),
            FakeAttachments::with("att-1", b"\x89PNG cat".to_vec()),
        );
        let mut message = inbound_message("m1", "what is this?");
        message.attachments.push(image("att-1", "cat.png"));

        let outcome = harness
            .engine
            .handle_event(InboundEvent::Message(message))
            .await;

        assert_eq!(outcome, TurnOutcome::Replied { deliveries: 1 });
        assert_eq!(harness.model.descriptions(), 1);

        let prompt = &harness.model.prompts()[0];
        assert!(
            prompt
                .iter()
                .any(|m| m.content.contains("cat.png: a scripted description"))
        );
        // Newly attached images are described, not sent back.
        assert_eq!(
            harness.messaging.sent()[0].1,
            OutboundResponse::Text("A cat.".into())
        );

        let handle = harness
            .engine
            .store()
            .get(&conversation_ref().conversation_id)
            .await
            .expect("state exists");
        let state = handle.lock().await;
        let chunk = state.image_chunks().next().expect("stored image");
        assert_eq!(chunk.text, "cat.png: a scripted description");
        assert_eq!(
            chunk.image.as_ref().map(|i| i.description.as_str()),
            Some("a scripted description")
        );
        assert_eq!(chunk.provenance.message_id, "m1");
    }

    #[tokio::test]
    async fn replied_to_image_goes_back_out_with_the_reply() {
        let harness = harness_with(
            FakeModel::new(&["That is a map."]),
            FakeAttachments::with("att-7", b"GIF89a map".to_vec()),
        );
        let mut message = inbound_message("m9", "what does this show?");
        message.reply_to = Some(ReplyReference {
            message_id: "m3".into(),
            author: Some(Author {
                id: "u2".into(),
                display_name: "bob".into(),
                is_bot: false,
            }),
            attachments: vec![image("att-7", "map.gif")],
        });

        let outcome = harness
            .engine
            .handle_event(InboundEvent::Message(message))
            .await;

        assert_eq!(outcome, TurnOutcome::Replied { deliveries: 1 });
        assert_eq!(harness.model.descriptions(), 1);
        let sent = harness.messaging.sent();
        assert!(matches!(
            &sent[0].1,
            OutboundResponse::File { filename, caption: Some(caption), data, .. }
                if filename == "map.gif" && caption == "That is a map." && data == b"GIF89a map"
        ));

        let handle = harness
            .engine
            .store()
            .get(&conversation_ref().conversation_id)
            .await
            .expect("state exists");
        let state = handle.lock().await;
        let chunk = state.image_chunks().next().expect("stored image");
        assert_eq!(chunk.provenance.message_id, "m3");
        assert_eq!(chunk.provenance.author_name.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn stalled_conversation_does_not_hold_up_others() {
        let harness = harness_with(
            FakeModel::new(&["hello b"]).stall_on("stall"),
            FakeAttachments::default(),
        );
        let engine = Arc::new(harness.engine);
        let model = harness.model.clone();
        let messaging = harness.messaging.clone();

        let mut events: Vec<InboundEvent> = (0..100)
            .map(|i| {
                InboundEvent::Message(in_conversation(
                    inbound_message(&format!("a{i}"), "stall please"),
                    "chan-a",
                ))
            })
            .collect();
        events.push(InboundEvent::Message(in_conversation(
            inbound_message("b1", "hi"),
            "chan-b",
        )));
        let events: InboundStream =
            Box::pin(futures::stream::iter(events).chain(futures::stream::pending()));

        let shutdown = {
            let messaging = messaging.clone();
            let model = model.clone();
            async move { wait_until(|| !messaging.sent().is_empty() && model.calls() == 2).await }
        };
        tokio::time::timeout(Duration::from_secs(5), engine.clone().run(events, shutdown))
            .await
            .expect("run returns once shut down, despite the stalled turn");

        let (target, _) = &messaging.sent()[0];
        assert_eq!(&*target.conversation.conversation_id, "chan-b");
        assert_eq!(target.message_id.as_deref(), Some("b1"));
        // Only the first of conversation A's turns ever reached the model.
        assert_eq!(model.calls(), 2);

        let stalled = engine.store().get("chan-a").await.expect("state exists");
        let state = stalled.try_lock().expect("abandoned turn released its lock");
        assert!(state.storage_dir.as_ref().is_some_and(|dir| dir.exists()));
    }

    #[tokio::test]
    async fn idle_worker_exits_and_is_replaced() {
        let harness = harness(&["pong"]);
        let engine = Arc::new(harness.engine.with_worker_idle(Duration::from_millis(20)));
        let messaging = harness.messaging.clone();

        let later = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            InboundEvent::Message(inbound_message("m2", "ping again"))
        };
        let events: InboundStream = Box::pin(
            futures::stream::iter(vec![InboundEvent::Message(inbound_message("m1", "ping"))])
                .chain(futures::stream::once(later))
                .chain(futures::stream::pending()),
        );

        let shutdown = {
            let messaging = messaging.clone();
            async move { wait_until(|| messaging.sent().len() == 2).await }
        };
        tokio::time::timeout(Duration::from_secs(5), engine.clone().run(events, shutdown))
            .await
            .expect("second event processed");

        let handle = engine
            .store()
            .get(&conversation_ref().conversation_id)
            .await
            .expect("state exists");
        assert_eq!(handle.lock().await.history.len(), 4);
    }
}
