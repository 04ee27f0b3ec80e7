//! Turns a streamed model answer into platform-legal deliveries.
//!
//! The stream is aggregated in full before anything is inspected. Embedded
//! `<file name="...">body</file>` blocks become file payloads; the visible
//! text is split into size-bounded slices; oversized files become warnings.

use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, Error, Result};
use crate::llm::model::FragmentStream;
use crate::messaging::traits::MessagingDyn;
use crate::{OutboundResponse, ReplyTarget};

use futures::StreamExt as _;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

static FILE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<file\s+name\s*=\s*"([^"]+)"\s*>(.*?)</file>"#).expect("hardcoded file block regex")
});

/// A file to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub filename: String,
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl FilePayload {
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        let filename = filename.into();
        let mime_type = mime_guess::from_path(&filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self {
            filename,
            data,
            mime_type,
        }
    }

    /// Read a stored file for re-attachment.
    pub async fn read(path: &Path, filename: &str) -> std::result::Result<Self, DeliveryError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|error| DeliveryError::ReadFailed {
                path: path.display().to_string(),
                message: error.to_string(),
            })?;
        Ok(Self::new(filename, data))
    }
}

/// The aggregated stream. A stream that failed midway keeps what arrived.
#[derive(Debug)]
pub struct Aggregated {
    pub text: String,
    pub error: Option<Error>,
}

/// Concatenate fragments in arrival order.
pub async fn aggregate(mut stream: FragmentStream) -> Aggregated {
    let mut text = String::new();
    while let Some(fragment) = stream.next().await {
        match fragment {
            Ok(fragment) => text.push_str(&fragment),
            Err(error) => {
                return Aggregated {
                    text,
                    error: Some(error),
                };
            }
        }
    }
    Aggregated { text, error: None }
}

/// Visible text plus extracted file payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledReply {
    pub text: String,
    pub files: Vec<FilePayload>,
}

impl AssembledReply {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.files.is_empty()
    }
}

/// Extract every file block, strip it from the text, and trim the rest.
pub fn extract_files(text: &str) -> AssembledReply {
    let files = FILE_BLOCK
        .captures_iter(text)
        .map(|captures| {
            FilePayload::new(
                captures[1].trim(),
                captures[2].as_bytes().to_vec(),
            )
        })
        .collect();
    let visible = FILE_BLOCK.replace_all(text, "");
    AssembledReply {
        text: visible.trim().to_string(),
        files,
    }
}

/// Split text into order-preserving slices of at most `max_chars` characters.
///
/// Each slice is as long as the limit allows, backing off to the last newline
/// in the back half of the window, else the last newline or space. Concatenating the slices
/// reproduces the input exactly.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let max_chars = max_chars.max(1);
    let mut slices = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        // Byte offset just past the `max_chars`-th character.
        let Some((window_end, _)) = remaining.char_indices().nth(max_chars) else {
            slices.push(remaining.to_string());
            break;
        };
        let window = &remaining[..window_end];
        let newline = window.rfind('\n');
        let space = window.rfind(' ');
        // A newline wins unless it would leave the slice under half full.
        let split_at = match newline {
            Some(index) if index >= window_end / 2 => Some(index),
            _ => newline.max(space),
        }
        .map(|index| index + 1)
        .unwrap_or(window_end);
        slices.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
    }

    slices
}

/// Human-readable byte size.
pub fn format_size(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

/// Order the reply into individual deliveries.
///
/// The first file rides with the first text slice when inline captions are
/// allowed. Remaining text goes before remaining files. Files over the byte
/// ceiling are replaced by a warning.
pub fn plan_deliveries(reply: AssembledReply, config: &DeliveryConfig) -> Vec<OutboundResponse> {
    let mut texts = split_text(&reply.text, config.max_message_chars);
    let mut files = Vec::new();

    for file in reply.files {
        if file.data.len() > config.max_file_bytes {
            tracing::warn!(
                filename = %file.filename,
                size = file.data.len(),
                limit = config.max_file_bytes,
                "file payload over size ceiling, not sending"
            );
            texts.extend(split_text(
                &format!(
                    "⚠️ `{}` is too large to send ({}).",
                    file.filename,
                    format_size(file.data.len())
                ),
                config.max_message_chars,
            ));
        } else {
            files.push(file);
        }
    }

    let mut deliveries = Vec::with_capacity(texts.len() + files.len());
    let mut texts = texts.into_iter();
    let mut files = files.into_iter();

    if let Some(first) = files.next() {
        let caption = if config.inline_file_caption { texts.next() } else { None };
        deliveries.push(OutboundResponse::File {
            filename: first.filename,
            data: first.data,
            mime_type: first.mime_type,
            caption,
        });
    }
    deliveries.extend(texts.map(OutboundResponse::Text));
    deliveries.extend(files.map(|file| OutboundResponse::File {
        filename: file.filename,
        data: file.data,
        mime_type: file.mime_type,
        caption: None,
    }));

    // Without inline captions, text still precedes every file.
    if !config.inline_file_caption {
        deliveries.sort_by_key(|d| matches!(d, OutboundResponse::File { .. }));
    }

    deliveries
}

/// Send deliveries in order, pausing between them. Returns how many were sent.
///
/// Stops at the first send failure.
pub async fn deliver(
    messaging: &dyn MessagingDyn,
    target: &ReplyTarget,
    deliveries: Vec<OutboundResponse>,
    pacing: Duration,
) -> Result<usize> {
    let mut sent = 0;
    for delivery in deliveries {
        if sent > 0 && !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
        messaging
            .respond(target, delivery)
            .await
            .map_err(|error| DeliveryError::SendFailed(error.to_string()))?;
        sent += 1;
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;

    fn config(max_message_chars: usize, max_file_bytes: usize, inline: bool) -> DeliveryConfig {
        DeliveryConfig {
            max_message_chars,
            max_file_bytes,
            inline_file_caption: inline,
            pacing_ms: 0,
        }
    }

    #[test]
    fn split_reproduces_text_exactly() {
        let samples = [
            "short".to_string(),
            "word ".repeat(97),
            "line one\nline two\nline three\n".repeat(13),
            "x".repeat(250),
            "héllo wörld ✨ ".repeat(40),
            "no-spaces-héré-at-all".repeat(12),
        ];
        for text in &samples {
            for max in [1, 2, 7, 16, 50, 2000] {
                let slices = split_text(text, max);
                assert_eq!(slices.concat(), *text, "max {max}");
                assert!(slices.iter().all(|s| s.chars().count() <= max && !s.is_empty()));
            }
        }
        assert!(split_text("", 10).is_empty());
    }

    #[test]
    fn split_prefers_boundaries() {
        let slices = split_text("alpha beta gamma", 12);
        assert_eq!(slices, vec!["alpha beta ", "gamma"]);

        let slices = split_text("one two\nthree", 10);
        assert_eq!(slices, vec!["one two\n", "three"]);

        // An early newline loses to a much later space.
        let slices = split_text("one\ntwo three", 10);
        assert_eq!(slices, vec!["one\ntwo ", "three"]);
    }

    #[test]
    fn split_keeps_slices_well_filled() {
        let text = format!("hi\n{}", "word ".repeat(40));
        let slices = split_text(&text, 50);
        assert_eq!(slices.concat(), text);
        let first = slices[0].chars().count();
        assert!(first >= 45, "first slice only {first} chars: {:?}", slices[0]);
    }

    #[test]
    fn file_blocks_are_extracted_and_stripped() {
        let text = indoc::indoc! {r#"
            Here you go:
            <file name="notes.md">
            # Notes
            - one
            </file>
            and also <file name = "data.json">{"a": 1}</file>
            Done.
        "#};

        let reply = extract_files(text);
        assert_eq!(reply.files.len(), 2);
        assert_eq!(reply.files[0].filename, "notes.md");
        assert_eq!(reply.files[0].data, b"\n# Notes\n- one\n".to_vec());
        assert_eq!(reply.files[1].filename, "data.json");
        assert_eq!(reply.files[1].mime_type, "application/json");
        assert_eq!(reply.files[1].data, br#"{"a": 1}"#.to_vec());
        assert!(!reply.text.contains("<file"));
        assert!(!reply.text.contains("</file>"));
        assert!(reply.text.starts_with("Here you go:"));
        assert!(reply.text.ends_with("Done."));
    }

    #[test]
    fn first_file_rides_with_first_slice() {
        let reply = AssembledReply {
            text: "aaaa bbbb cccc".into(),
            files: vec![
                FilePayload::new("one.txt", b"1".to_vec()),
                FilePayload::new("two.txt", b"2".to_vec()),
            ],
        };
        let deliveries = plan_deliveries(reply, &config(5, 1024, true));

        assert_eq!(deliveries.len(), 4);
        assert!(matches!(
            &deliveries[0],
            OutboundResponse::File { filename, caption: Some(caption), .. }
                if filename == "one.txt" && caption == "aaaa "
        ));
        assert_eq!(deliveries[1], OutboundResponse::Text("bbbb ".into()));
        assert_eq!(deliveries[2], OutboundResponse::Text("cccc".into()));
        assert!(matches!(
            &deliveries[3],
            OutboundResponse::File { filename, caption: None, .. } if filename == "two.txt"
        ));
    }

    #[test]
    fn without_inline_captions_text_comes_first() {
        let reply = AssembledReply {
            text: "hello".into(),
            files: vec![FilePayload::new("one.txt", b"1".to_vec())],
        };
        let deliveries = plan_deliveries(reply, &config(100, 1024, false));
        assert_eq!(deliveries[0], OutboundResponse::Text("hello".into()));
        assert!(matches!(&deliveries[1], OutboundResponse::File { caption: None, .. }));
    }

    #[test]
    fn oversized_files_become_warnings() {
        let reply = AssembledReply {
            text: String::new(),
            files: vec![FilePayload::new("huge.bin", vec![0; 3 * 1024])],
        };
        let deliveries = plan_deliveries(reply, &config(2000, 1024, true));
        assert_eq!(
            deliveries,
            vec![OutboundResponse::Text("⚠️ `huge.bin` is too large to send (3.0 KiB).".into())]
        );
    }

    #[tokio::test]
    async fn aggregate_keeps_partial_text_on_error() {
        let stream: FragmentStream = Box::pin(futures::stream::iter(vec![
            Ok("Hel".to_string()),
            Ok("lo".to_string()),
            Err(LlmError::CompletionFailed("connection reset".into()).into()),
            Ok("never".to_string()),
        ]));
        let aggregated = aggregate(stream).await;
        assert_eq!(aggregated.text, "Hello");
        assert!(aggregated.error.is_some());
    }
}
