//! Persisted artifact layout.
//!
//! Conversations live at `<root>/<community-name>_<community>/<conversation-name>_<conversation>/`.
//! Every artifact name embeds a community token segment (`g<community>`) so
//! files can be validated independently of their directory:
//!
//! | artifact | tokenized | legacy |
//! |---|---|---|
//! | state | `state.g123.json` | `state.json` |
//! | chunks | `chunks.g123.k-<key>.json` | `chunks.k-<key>.json` |
//! | factoid | `factoid.g123.t-<slug>.json` | `factoid.t-<slug>.json` |
//! | match log | `factoid-matches.g123.jsonl` | `factoid-matches.jsonl` |
//! | match stats | `match-stats.g123.json` | `match-stats.json` |

use regex::Regex;
use std::sync::LazyLock;

static TOKEN_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]+$").expect("hardcoded token regex"));

/// Longest sanitized display name kept in a directory name.
const MAX_NAME_LEN: usize = 40;

/// Directory holding stored image attachments, inside a conversation directory.
pub const ATTACHMENTS_DIR: &str = "attachments";

/// The kinds of artifact a conversation directory may hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    State,
    Chunks { key: String },
    Factoid { slug: String },
    MatchLog,
    MatchStats,
}

impl ArtifactKind {
    fn prefix(&self) -> &'static str {
        match self {
            ArtifactKind::State => "state",
            ArtifactKind::Chunks { .. } => "chunks",
            ArtifactKind::Factoid { .. } => "factoid",
            ArtifactKind::MatchLog => "factoid-matches",
            ArtifactKind::MatchStats => "match-stats",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::MatchLog => "jsonl",
            _ => "json",
        }
    }

    fn key_segment(&self) -> Option<String> {
        match self {
            ArtifactKind::Chunks { key } => Some(format!("k-{key}")),
            ArtifactKind::Factoid { slug } => Some(format!("t-{slug}")),
            _ => None,
        }
    }

    /// File name for this artifact. `community` None produces the legacy form.
    pub fn file_name(&self, community: Option<&str>) -> String {
        let mut segments = vec![self.prefix().to_string()];
        if let Some(community) = community {
            segments.push(format!("g{}", community_token(community)));
        }
        if let Some(key) = self.key_segment() {
            segments.push(key);
        }
        segments.push(self.extension().to_string());
        segments.join(".")
    }

    /// Token-independent identity of the artifact, used to pair legacy and tokenized files.
    pub fn logical_key(&self) -> String {
        self.file_name(None)
    }
}

/// A parsed artifact file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArtifact {
    pub kind: ArtifactKind,
    /// Community token embedded in the name; None for legacy artifacts.
    pub token: Option<String>,
}

impl ParsedArtifact {
    pub fn logical_key(&self) -> String {
        self.kind.logical_key()
    }
}

/// Parse an artifact file name. Returns None for anything that isn't ours.
pub fn parse_artifact_name(file_name: &str) -> Option<ParsedArtifact> {
    let segments: Vec<&str> = file_name.split('.').collect();
    if segments.len() < 2 {
        return None;
    }
    let prefix = segments[0];
    let extension = segments[segments.len() - 1];
    let middle = &segments[1..segments.len() - 1];

    let mut token = None;
    let mut key = None;
    for segment in middle {
        if let Some(rest) = segment.strip_prefix("k-").or_else(|| segment.strip_prefix("t-")) {
            if key.is_some() || rest.is_empty() {
                return None;
            }
            key = Some(rest.to_string());
        } else if let Some(rest) = segment.strip_prefix('g') {
            if token.is_some() || key.is_some() || !TOKEN_CHARS.is_match(rest) {
                return None;
            }
            token = Some(rest.to_string());
        } else {
            return None;
        }
    }

    let kind = match (prefix, extension, key) {
        ("state", "json", None) => ArtifactKind::State,
        ("chunks", "json", Some(key)) if middle.iter().any(|s| s.starts_with("k-")) => {
            ArtifactKind::Chunks { key }
        }
        ("factoid", "json", Some(slug)) if middle.iter().any(|s| s.starts_with("t-")) => {
            ArtifactKind::Factoid { slug }
        }
        ("factoid-matches", "jsonl", None) => ArtifactKind::MatchLog,
        ("match-stats", "json", None) => ArtifactKind::MatchStats,
        _ => return None,
    };

    Some(ParsedArtifact { kind, token })
}

/// Normalize a community id into the form embedded in names.
pub fn community_token(community_id: &str) -> String {
    community_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Sanitize a display name for use in a directory name.
pub fn sanitize_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            sanitized.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !sanitized.is_empty() {
            sanitized.push('-');
            last_dash = true;
        }
        if sanitized.len() >= MAX_NAME_LEN {
            break;
        }
    }
    let trimmed = sanitized.trim_end_matches('-');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Sanitize a key (factoid term, document key) for use inside a file name.
///
/// A short content hash keeps keys that sanitize identically apart.
pub fn sanitize_key(key: &str) -> String {
    let hash = crate::memory::ingest::content_hash(key);
    format!("{}-{}", sanitize_name(key), &hash[..8])
}

/// `<sanitized-name>_<id>` directory name.
pub fn dir_name(name: &str, id: &str) -> String {
    format!("{}_{}", sanitize_name(name), community_token(id))
}

/// Id suffix of a `<name>_<id>` directory name.
pub fn parse_dir_id(dir_name: &str) -> Option<&str> {
    let (_, id) = dir_name.rsplit_once('_')?;
    if id.is_empty() || !TOKEN_CHARS.is_match(id) {
        return None;
    }
    Some(id)
}

/// Name part of a `<name>_<id>` directory name.
pub fn parse_dir_name(dir_name: &str) -> &str {
    dir_name
        .rsplit_once('_')
        .map(|(name, _)| name)
        .unwrap_or(dir_name)
}
