//! Image selection for a turn: precedence, relevance gating, deduplication.

use crate::InboundMessage;
use crate::memory::search::{SearchConfig, rank};
use crate::memory::types::{Chunk, ImageLink};
use crate::state::types::ConversationState;

use std::collections::HashSet;

const PLACEHOLDER_PREFIX: &str = "Image attachment: ";

/// Words that mark a turn as a question or a request to look at something.
const INTERROGATIVE_MARKERS: &[&str] = &[
    "what", "whats", "what's", "who", "whos", "who's", "where", "which", "how", "why", "describe",
    "explain", "identify", "tell", "show",
];

/// Words that mark a turn as being about an image.
const IMAGE_VOCABULARY: &[&str] = &[
    "image",
    "images",
    "picture",
    "pictures",
    "pic",
    "pics",
    "photo",
    "photos",
    "screenshot",
    "screenshots",
    "drawing",
    "sketch",
    "painting",
    "artwork",
    "meme",
    "selfie",
    "diagram",
    "chart",
    "graph",
    "png",
    "jpg",
    "jpeg",
    "gif",
];

/// Description recorded at ingestion until the vision model produces a real one.
pub fn placeholder_description(filename: &str) -> String {
    format!("{PLACEHOLDER_PREFIX}{filename}")
}

/// Whether an image's description is still the ingestion placeholder.
pub fn is_stale(image: &ImageLink) -> bool {
    let description = image.description.trim();
    description.is_empty() || description == placeholder_description(&image.filename)
}

/// How an image came to be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// The turn's text names the file.
    NamedInText,
    /// Attached to the message being replied to.
    RepliedTo,
    /// Attached to the current turn.
    NewlyAttached,
    /// Best similarity match, for turns that ask about an image.
    Similarity,
}

/// The images chosen for one turn.
#[derive(Debug, Clone)]
pub struct ImageSelection {
    pub source: ImageSource,
    pub chunks: Vec<Chunk>,
}

impl ImageSelection {
    /// Whether the selected files go back out with the reply, not just into the prompt.
    pub fn reattach(&self) -> bool {
        matches!(self.source, ImageSource::NamedInText | ImageSource::RepliedTo)
    }

    /// Selected chunks whose description still needs the vision model.
    pub fn stale(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks
            .iter()
            .filter(|c| c.image.as_ref().is_some_and(is_stale))
    }
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

/// Heuristic: does the text ask something about an image?
///
/// Requires both an interrogative marker and an image-vocabulary term.
pub fn is_about_image(text: &str) -> bool {
    let mut interrogative = text.contains('?');
    let mut vocabulary = false;
    for word in words(text) {
        interrogative |= INTERROGATIVE_MARKERS.contains(&word.as_str());
        vocabulary |= IMAGE_VOCABULARY.contains(&word.as_str());
        if interrogative && vocabulary {
            return true;
        }
    }
    false
}

/// Whether `content` mentions `filename` as a whole name, not as the tail
/// or head of a longer one. Both arguments are already lowercased.
fn names_file(content: &str, filename: &str) -> bool {
    let part_of_name = |c: char| c.is_alphanumeric() || matches!(c, '_' | '-');
    content.match_indices(filename).any(|(start, _)| {
        let before = content[..start].chars().next_back();
        let after = content[start + filename.len()..].chars().next();
        !before.is_some_and(|c| part_of_name(c) || c == '.') && !after.is_some_and(part_of_name)
    })
}

/// Drop repeats by stored path, then by source filename, then by raw text.
/// First occurrence wins.
pub fn dedupe(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut seen_paths = HashSet::new();
    let mut seen_filenames = HashSet::new();
    let mut seen_texts = HashSet::new();

    chunks
        .into_iter()
        .filter(|c| match &c.image {
            Some(image) => seen_paths.insert(image.path.clone()),
            None => true,
        })
        .filter(|c| match &c.image {
            Some(image) => seen_filenames.insert(image.filename.clone()),
            None => true,
        })
        .filter(|c| seen_texts.insert(c.text.clone()))
        .collect()
}

/// Pick images for a turn. First non-empty source wins:
/// named in text, replied-to, newly attached, then the single best similarity
/// match when the turn is about an image.
pub fn select_images(
    state: &ConversationState,
    message: &InboundMessage,
    query: Option<&[f32]>,
) -> Option<ImageSelection> {
    let content = message.content.to_lowercase();

    let named: Vec<Chunk> = state
        .image_chunks()
        .filter(|c| {
            c.image.as_ref().is_some_and(|image| {
                !image.filename.is_empty() && names_file(&content, &image.filename.to_lowercase())
            })
        })
        .cloned()
        .collect();
    if let Some(selection) = finish(ImageSource::NamedInText, named) {
        return Some(selection);
    }

    if let Some(reply) = &message.reply_to {
        let replied: Vec<Chunk> = state
            .image_chunks()
            .filter(|c| {
                c.provenance.message_id == reply.message_id
                    || c.provenance.attachment_id.as_ref().is_some_and(|id| {
                        reply.attachments.iter().any(|a| &a.id == id)
                    })
            })
            .cloned()
            .collect();
        if let Some(selection) = finish(ImageSource::RepliedTo, replied) {
            return Some(selection);
        }
    }

    let attached: Vec<Chunk> = state
        .image_chunks()
        .filter(|c| c.provenance.message_id == message.id)
        .cloned()
        .collect();
    if let Some(selection) = finish(ImageSource::NewlyAttached, attached) {
        return Some(selection);
    }

    let query = query?;
    if !is_about_image(&message.content) {
        return None;
    }
    let best: Vec<Chunk> = rank(
        query,
        state.image_chunks(),
        SearchConfig {
            threshold: state.options.similarity_threshold,
            limit: 1,
        },
    )
    .into_iter()
    .map(|m| m.item.clone())
    .collect();
    finish(ImageSource::Similarity, best)
}

fn finish(source: ImageSource, chunks: Vec<Chunk>) -> Option<ImageSelection> {
    let chunks = dedupe(chunks);
    if chunks.is_empty() {
        return None;
    }
    tracing::debug!(?source, count = chunks.len(), "selected images");
    Some(ImageSelection { source, chunks })
}

/// Rewrite an image chunk in place with a regenerated description.
///
/// Returns false when the chunk no longer exists.
pub fn apply_description(
    state: &mut ConversationState,
    chunk_id: &str,
    description: &str,
    embedding: Option<Vec<f32>>,
) -> bool {
    let Some(chunk) = state.chunk_mut(chunk_id) else {
        return false;
    };
    let Some(image) = chunk.image.as_mut() else {
        return false;
    };
    image.description = description.to_string();
    chunk.text = format!("{}: {}", image.filename, description);
    if let Some(embedding) = embedding {
        chunk.embedding = embedding;
    }
    true
}
