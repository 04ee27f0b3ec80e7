//! Prompt composition for one turn.
//!
//! Order: prime directive, sticky instructions, earlier history, retrieved
//! context, image descriptions, extension context, then the live turn.

use crate::conversation::history::{Role, Turn};
use crate::error::{MemoryError, Result};
use crate::llm::model::ChatMessage;
use crate::memory::images::ImageSelection;
use crate::memory::search::RetrievedContext;
use crate::state::types::ConversationState;

static RETRIEVED_TEMPLATE: &str = "\
{%- if chunks %}Relevant earlier messages from this conversation:
{% for chunk in chunks %}- {% if chunk.author %}{{ chunk.author }}: {% endif %}{{ chunk.text }}
{% endfor %}{% endif %}
{%- if factoids %}Facts this conversation has taught you:
{% for factoid in factoids %}- {{ factoid.term }} {{ factoid.fact }}
{% endfor %}{% endif %}";

/// Everything that goes into one prompt.
pub struct PromptInputs<'a> {
    pub prime_directive: &'a str,
    pub state: &'a ConversationState,
    pub live: &'a Turn,
    pub retrieved: &'a RetrievedContext,
    pub images: Option<&'a ImageSelection>,
    pub extension_contexts: &'a [String],
}

fn render_turn(turn: &Turn) -> ChatMessage {
    match turn.role {
        Role::User => match &turn.author {
            Some(author) => ChatMessage::user(format!("{author}: {}", turn.content)),
            None => ChatMessage::user(turn.content.clone()),
        },
        Role::Assistant => ChatMessage::assistant(turn.content.clone()),
        Role::System => ChatMessage::system(turn.content.clone()),
    }
}

fn render_retrieved(retrieved: &RetrievedContext) -> Result<String> {
    let chunks: Vec<minijinja::Value> = retrieved
        .chunks
        .iter()
        .map(|m| {
            minijinja::context! {
                author => m.item.provenance.author_name,
                text => m.item.text,
            }
        })
        .collect();
    let factoids: Vec<minijinja::Value> = retrieved
        .factoids
        .iter()
        .map(|m| {
            minijinja::context! {
                term => m.item.term,
                fact => m.item.fact,
            }
        })
        .collect();

    let environment = minijinja::Environment::new();
    let rendered = environment
        .render_str(
            RETRIEVED_TEMPLATE,
            minijinja::context! { chunks => chunks, factoids => factoids },
        )
        .map_err(|error| MemoryError::Template(error.to_string()))?;
    Ok(rendered.trim().to_string())
}

fn render_images(selection: &ImageSelection) -> String {
    let mut text = String::from("Images relevant to this message:");
    for chunk in &selection.chunks {
        let description = chunk
            .image
            .as_ref()
            .map(|image| format!("{}: {}", image.filename, image.description))
            .unwrap_or_else(|| chunk.text.clone());
        text.push_str("\n- ");
        text.push_str(&description);
    }
    text
}

/// Build the ordered message list for the model.
pub fn compose(inputs: &PromptInputs<'_>) -> Result<Vec<ChatMessage>> {
    let mut messages = Vec::new();

    if !inputs.prime_directive.trim().is_empty() {
        messages.push(ChatMessage::system(inputs.prime_directive.trim()));
    }
    messages.extend(inputs.state.instructions.iter().map(render_turn));

    let live_id = inputs.live.message_id.as_deref();
    messages.extend(
        inputs
            .state
            .history
            .turns()
            .filter(|turn| live_id.is_none() || turn.message_id.as_deref() != live_id)
            .map(render_turn),
    );

    if !inputs.retrieved.is_empty() {
        let rendered = render_retrieved(inputs.retrieved)?;
        if !rendered.is_empty() {
            messages.push(ChatMessage::system(rendered));
        }
    }

    if let Some(selection) = inputs.images {
        messages.push(ChatMessage::system(render_images(selection)));
    }

    messages.extend(
        inputs
            .extension_contexts
            .iter()
            .map(|context| ChatMessage::system(context.clone())),
    );

    messages.push(render_turn(inputs.live));
    Ok(messages)
}
