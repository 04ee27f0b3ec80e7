//! Bounded, FIFO-evicted history window.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Who spoke a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One exchanged turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: Role,
    /// Display name of the speaker, for group-chat attribution.
    #[serde(default)]
    pub author: Option<String>,
    pub content: String,
    #[serde(default)]
    pub message_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Turn {
    pub fn user(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            author: Some(author.into()),
            content: content.into(),
            message_id: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            author: None,
            content: content.into(),
            message_id: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            author: None,
            content: content.into(),
            message_id: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Length counted against the history budget, in characters.
    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Ordered, most-recent-last window of turns with a character budget.
///
/// `length` always equals the sum of the present turns' lengths. The budget
/// is only exceeded while a single oversized turn is the sole survivor.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    turns: VecDeque<Turn>,
    length: usize,
    max_length: usize,
}

impl HistoryWindow {
    pub fn new(max_length: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            length: 0,
            max_length,
        }
    }

    /// Rebuild a window from persisted turns, re-applying the current budget.
    pub fn from_turns(max_length: usize, turns: impl IntoIterator<Item = Turn>) -> Self {
        let mut window = Self::new(max_length);
        for turn in turns {
            window.add_turn(turn);
        }
        window
    }

    /// Append a turn and evict from the front until the budget holds.
    ///
    /// Returns the evicted turns, oldest first.
    pub fn add_turn(&mut self, turn: Turn) -> Vec<Turn> {
        self.length += turn.len();
        self.turns.push_back(turn);

        let mut evicted = Vec::new();
        while self.length > self.max_length && self.turns.len() > 1 {
            let Some(oldest) = self.turns.pop_front() else {
                break;
            };
            self.length -= oldest.len();
            evicted.push(oldest);
        }

        if self.turns.is_empty() {
            self.length = 0;
        }

        evicted
    }

    /// Remove every turn.
    pub fn clear(&mut self) {
        self.turns.clear();
        self.length = 0;
    }

    /// Change the budget, evicting as needed.
    pub fn set_max_length(&mut self, max_length: usize) {
        self.max_length = max_length;
        while self.length > self.max_length && self.turns.len() > 1 {
            if let Some(oldest) = self.turns.pop_front() {
                self.length -= oldest.len();
            }
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> impl DoubleEndedIterator<Item = &Turn> + ExactSizeIterator {
        self.turns.iter()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.back()
    }

    /// Snapshot for persistence.
    pub fn to_vec(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }
}
