//! Ingestion: turn message text and attachments into retrievable chunks.

use crate::error::{MemoryError, Result};
use crate::memory::embedding::Embedder;
use crate::memory::images::placeholder_description;
use crate::memory::types::{Chunk, Document, ImageLink, Provenance};
use crate::state::types::ConversationState;
use crate::{Attachment, Author, ConversationRef, InboundMessage, ReplyReference};

use sha2::{Digest, Sha256};
use std::path::Path;

/// SHA-256 hex digest of content, used for stable keys and file names.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Split text into chunks at line boundaries.
///
/// Chunks target `chunk_size` characters and don't split mid-line. A line
/// longer than `chunk_size` is split at word boundaries, and a single word
/// longer than that is split wherever it has to be.
pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    if text.chars().count() <= chunk_size {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current_chunk = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        for piece in split_long_line(line, chunk_size) {
            let piece_len = piece.chars().count();
            if !current_chunk.is_empty() && current_len + piece_len + 1 > chunk_size {
                chunks.push(std::mem::take(&mut current_chunk));
                current_len = 0;
            }

            if !current_chunk.is_empty() {
                current_chunk.push('\n');
                current_len += 1;
            }
            current_chunk.push_str(&piece);
            current_len += piece_len;
        }
    }

    if !current_chunk.is_empty() {
        chunks.push(current_chunk);
    }

    chunks
}

fn split_long_line(line: &str, chunk_size: usize) -> Vec<String> {
    if line.chars().count() <= chunk_size {
        return vec![line.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in line.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > chunk_size {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            pieces.extend(chars.chunks(chunk_size).map(|c| c.iter().collect::<String>()));
            continue;
        }
        if !current.is_empty() && current_len + word_len + 1 > chunk_size {
            pieces.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += word_len;
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Fetches attachment bytes from the chat platform's CDN.
#[async_trait::async_trait]
pub trait AttachmentSource: Send + Sync {
    async fn fetch(&self, attachment: &Attachment) -> Result<Vec<u8>>;
}

/// Downloads attachments over HTTP.
pub struct HttpAttachmentSource {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpAttachmentSource {
    pub fn new(client: reqwest::Client, max_bytes: usize) -> Self {
        Self { client, max_bytes }
    }
}

#[async_trait::async_trait]
impl AttachmentSource for HttpAttachmentSource {
    async fn fetch(&self, attachment: &Attachment) -> Result<Vec<u8>> {
        let failed = |message: String| MemoryError::DownloadFailed {
            filename: attachment.filename.clone(),
            message,
        };

        if attachment
            .size_bytes
            .is_some_and(|size| size as usize > self.max_bytes)
        {
            return Err(failed(format!("larger than {} bytes", self.max_bytes)).into());
        }

        let response = self
            .client
            .get(&attachment.url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("status {status}")).into());
        }
        let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
        if bytes.len() > self.max_bytes {
            return Err(failed(format!("larger than {} bytes", self.max_bytes)).into());
        }

        tracing::debug!(
            filename = %attachment.filename,
            size = bytes.len(),
            "downloaded attachment"
        );
        Ok(bytes.to_vec())
    }
}

/// Mime type for an attachment, guessed from its filename when the platform
/// didn't say.
pub fn effective_mime(attachment: &Attachment) -> String {
    if !attachment.mime_type.is_empty() {
        return attachment.mime_type.clone();
    }
    mime_guess::from_path(&attachment.filename)
        .first_or_octet_stream()
        .to_string()
}

/// The message an attachment was posted on.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentOrigin<'a> {
    pub conversation: &'a ConversationRef,
    pub message_id: &'a str,
    pub author: Option<&'a Author>,
}

impl<'a> AttachmentOrigin<'a> {
    pub fn message(message: &'a InboundMessage) -> Self {
        Self {
            conversation: &message.conversation,
            message_id: &message.id,
            author: Some(&message.author),
        }
    }

    /// The message `message` replies to.
    pub fn replied_to(message: &'a InboundMessage, reply: &'a ReplyReference) -> Self {
        Self {
            conversation: &message.conversation,
            message_id: &reply.message_id,
            author: reply.author.as_ref(),
        }
    }
}

fn provenance(origin: AttachmentOrigin<'_>, attachment: Option<&Attachment>) -> Provenance {
    Provenance {
        community_id: origin.conversation.community_id.to_string(),
        conversation_id: origin.conversation.conversation_id.to_string(),
        message_id: origin.message_id.to_string(),
        attachment_id: attachment.map(|a| a.id.clone()),
        author_id: origin.author.map(|author| author.id.clone()),
        author_name: origin.author.map(|author| author.display_name.clone()),
    }
}

/// Chunk, embed and store text as one document. Returns the chunk count.
pub async fn ingest_text(
    state: &mut ConversationState,
    embedder: &dyn Embedder,
    key: String,
    text: &str,
    provenance: Provenance,
    chunk_chars: usize,
) -> Result<usize> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }

    let mut document = Document::new(key, None);
    for piece in chunk_text(text, chunk_chars) {
        if piece.trim().is_empty() {
            continue;
        }
        let embedding = embedder.embed(&piece).await?;
        document
            .chunks
            .push(Chunk::new(piece, embedding, provenance.clone()));
    }

    let count = document.chunks.len();
    tracing::debug!(
        conversation_id = %state.conversation_id(),
        key = %document.key,
        chunks = count,
        "ingested text"
    );
    state.put_document(document);
    Ok(count)
}

/// Ingest a message's own text, when it is long enough to be worth recalling.
pub async fn ingest_message(
    state: &mut ConversationState,
    embedder: &dyn Embedder,
    message: &InboundMessage,
    chunk_chars: usize,
    min_chars: usize,
) -> Result<usize> {
    if message.content.trim().chars().count() < min_chars {
        return Ok(0);
    }
    ingest_text(
        state,
        embedder,
        format!("msg-{}", message.id),
        &message.content,
        provenance(AttachmentOrigin::message(message), None),
        chunk_chars,
    )
    .await
}

/// Ingest one attachment, attributed to the message it was posted on.
///
/// Images are stored on disk with a placeholder description; text files are
/// chunked like message text; other types are skipped. Already-ingested
/// attachments are skipped.
pub async fn ingest_attachment(
    state: &mut ConversationState,
    embedder: &dyn Embedder,
    source: &dyn AttachmentSource,
    attachments_dir: &Path,
    origin: AttachmentOrigin<'_>,
    attachment: &Attachment,
    chunk_chars: usize,
) -> Result<usize> {
    if state.has_attachment(&attachment.id) {
        return Ok(0);
    }

    let mime_type = effective_mime(attachment);
    let key = format!("att-{}", attachment.id);

    if mime_type.starts_with("image/") {
        let bytes = source.fetch(attachment).await?;
        let stored_name = format!(
            "{}-{}",
            crate::state::layout::community_token(&attachment.id),
            sanitize_filename(&attachment.filename)
        );
        let path = attachments_dir.join(stored_name);

        let store_failed = |message: String| MemoryError::StoreFailed {
            filename: attachment.filename.clone(),
            message,
        };
        tokio::fs::create_dir_all(attachments_dir)
            .await
            .map_err(|e| store_failed(e.to_string()))?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| store_failed(e.to_string()))?;

        let description = placeholder_description(&attachment.filename);
        let embedding = embedder.embed(&description).await?;
        let chunk = Chunk::new(
            description.clone(),
            embedding,
            provenance(origin, Some(attachment)),
        )
        .with_image(ImageLink {
            path: path.clone(),
            filename: attachment.filename.clone(),
            mime_type,
            description,
        });

        let mut document = Document::new(key, None);
        document.chunks.push(chunk);
        state.put_document(document);

        tracing::info!(
            conversation_id = %state.conversation_id(),
            filename = %attachment.filename,
            path = %path.display(),
            "stored image attachment"
        );
        return Ok(1);
    }

    if attachment.is_text() || mime_type.starts_with("text/") {
        let bytes = source.fetch(attachment).await?;
        let text = String::from_utf8_lossy(&bytes);
        return ingest_text(
            state,
            embedder,
            key,
            &text,
            provenance(origin, Some(attachment)),
            chunk_chars,
        )
        .await;
    }

    tracing::debug!(
        filename = %attachment.filename,
        mime_type = %mime_type,
        "skipping unsupported attachment"
    );
    Ok(0)
}

fn sanitize_filename(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim_start_matches('.');
    if trimmed.is_empty() {
        "attachment".to_string()
    } else {
        trimmed.to_string()
    }
}
