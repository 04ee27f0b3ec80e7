//! Factoids: term normalization, learning, lookup and provenance replies.
//!
//! Normalization and statement parsing are table-driven. Rules run in order;
//! new rules are appended, never reordered.

use crate::error::{MemoryError, Result};
use crate::memory::types::{Factoid, FactoidProvenance, MatchLogEntry};
use crate::state::types::ConversationState;

use regex::Regex;
use std::sync::LazyLock;

/// One normalization step.
pub struct NormalizationRule {
    pub name: &'static str,
    pattern: &'static str,
    replacement: &'static str,
}

/// Applied in order to case-folded, trimmed text.
pub const NORMALIZATION_RULES: &[NormalizationRule] = &[
    NormalizationRule {
        name: "trailing punctuation",
        pattern: r"[\s?!.]+$",
        replacement: "",
    },
    NormalizationRule {
        name: "leading filler",
        pattern: r"^(?:(?:yo|hey|hi|ok|okay|so|um+|uh+|erm|pls|plz|please|oi)[\s,]+)+",
        replacement: "",
    },
    NormalizationRule {
        name: "slang interrogative",
        pattern: r"^(?:wtf|wth|wat|wut|whut)\s+(?:is|are|r|was)\s+",
        replacement: "",
    },
    NormalizationRule {
        name: "interrogative",
        pattern: r"^(?:what|who)(?:'s|s|\s+is|\s+are|\s+was|\s+were)\s+",
        replacement: "",
    },
    NormalizationRule {
        name: "tell me about",
        pattern: r"^(?:tell\s+me\s+about|define)\s+",
        replacement: "",
    },
    NormalizationRule {
        name: "leading article",
        pattern: r"^(?:the|a|an)\s+",
        replacement: "",
    },
    NormalizationRule {
        name: "whitespace",
        pattern: r"\s+",
        replacement: " ",
    },
];

static COMPILED_RULES: LazyLock<Vec<(&'static NormalizationRule, Regex)>> = LazyLock::new(|| {
    NORMALIZATION_RULES
        .iter()
        .map(|rule| {
            (
                rule,
                Regex::new(rule.pattern).expect("hardcoded normalization regex"),
            )
        })
        .collect()
});

/// Statement shapes that teach a factoid. First match wins.
const LEARN_PATTERNS: &[&str] = &[
    r"(?i)^(?:please\s+)?(?:remember|learn|note)\s+(?:that\s+)?(?P<term>.+?)\s+(?P<verb>is|are|means)\s+(?P<fact>.+)$",
    r"(?i)^(?P<term>.+?)\s+(?P<verb>is|are|means)\s+(?P<fact>.+)$",
    r"(?i)^(?P<term>[^=]+?)\s*=\s*(?P<fact>.+)$",
];

static LEARN_RULES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    LEARN_PATTERNS
        .iter()
        .map(|pattern| Regex::new(pattern).expect("hardcoded learn regex"))
        .collect()
});

static PROVENANCE_TEMPLATE: &str =
    "**{{ term }}** {{ fact }}\n_learned from {{ supplier }} on {{ learned_at }}: {{ permalink }}_";

/// Normalize a term or a whole turn into a factoid lookup key.
///
/// `"The Foo?"`, `"foo"` and `"A Foo"` all become `"foo"`.
pub fn normalize_term(text: &str) -> String {
    let mut normalized = text.trim().to_lowercase();
    for (rule, regex) in COMPILED_RULES.iter() {
        normalized = regex
            .replace_all(&normalized, rule.replacement)
            .into_owned();
    }
    normalized.trim().to_string()
}

/// A term/fact pair parsed from a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnedFact {
    /// Term as the supplier wrote it.
    pub term: String,
    /// Fact text including its linking verb, e.g. `"is a wizard"`.
    pub fact: String,
}

fn parse_with(rules: &[Regex], text: &str) -> Option<LearnedFact> {
    let text = text.trim();
    for regex in rules {
        let Some(captures) = regex.captures(text) else {
            continue;
        };
        let term = captures.name("term")?.as_str().trim();
        let fact = captures.name("fact")?.as_str().trim();
        if term.is_empty() || fact.is_empty() {
            continue;
        }
        let verb = captures.name("verb").map(|v| v.as_str()).unwrap_or("is");
        return Some(LearnedFact {
            term: term.to_string(),
            fact: format!("{} {}", verb.to_lowercase(), fact),
        });
    }
    None
}

/// Parse a chat message that explicitly asks to remember something.
pub fn parse_learn_statement(text: &str) -> Option<LearnedFact> {
    parse_with(&LEARN_RULES[..1], text)
}

/// Parse command arguments like `gandalf is a wizard` or `pi = 3.14159`.
pub fn parse_definition(text: &str) -> Option<LearnedFact> {
    parse_with(&LEARN_RULES, text)
}

/// Whether learning replaced an existing factoid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnOutcome {
    Created,
    Replaced,
}

/// Store a factoid under its normalized term. Re-learning replaces the fact.
///
/// Returns None when the term normalizes to nothing.
pub fn learn(
    state: &mut ConversationState,
    learned: &LearnedFact,
    embedding: Vec<f32>,
    provenance: FactoidProvenance,
) -> Option<LearnOutcome> {
    let term = normalize_term(&learned.term);
    if term.is_empty() {
        return None;
    }
    let factoid = Factoid {
        term: term.clone(),
        fact: learned.fact.clone(),
        embedding,
        provenance,
        created_at: chrono::Utc::now(),
    };
    let outcome = match state.factoids.insert(term.clone(), factoid) {
        Some(_) => LearnOutcome::Replaced,
        None => LearnOutcome::Created,
    };
    tracing::info!(
        conversation_id = %state.conversation_id(),
        term = %term,
        ?outcome,
        "factoid learned"
    );
    Some(outcome)
}

/// Remove a factoid by any spelling of its term.
pub fn forget(state: &mut ConversationState, term: &str) -> Option<Factoid> {
    let removed = state.factoids.remove(&normalize_term(term));
    if let Some(factoid) = &removed {
        tracing::info!(
            conversation_id = %state.conversation_id(),
            term = %factoid.term,
            "factoid forgotten"
        );
    }
    removed
}

/// Exact-match lookup of a turn's text against stored factoid terms.
pub fn lookup<'a>(state: &'a ConversationState, text: &str) -> Option<&'a Factoid> {
    let key = normalize_term(text);
    if key.is_empty() {
        return None;
    }
    state.factoids.get(&key)
}

/// Record a fast-path hit in the conversation's match statistics.
///
/// The returned entry is appended to the match log by the store.
pub fn record_match(
    state: &mut ConversationState,
    term: &str,
    requester_id: &str,
    message_id: &str,
) -> MatchLogEntry {
    let entry = MatchLogEntry {
        term: term.to_string(),
        requester_id: requester_id.to_string(),
        message_id: message_id.to_string(),
        conversation_id: state.conversation_id().to_string(),
        matched_at: chrono::Utc::now(),
    };
    state.match_stats.record(&entry);
    entry
}

/// Reply text for a fast-path hit, naming who supplied the fact, when, and where.
pub fn provenance_reply(factoid: &Factoid, permalink: &str) -> Result<String> {
    let mut environment = minijinja::Environment::new();
    environment
        .add_template("factoid", PROVENANCE_TEMPLATE)
        .map_err(|error| MemoryError::Template(error.to_string()))?;
    let template = environment
        .get_template("factoid")
        .map_err(|error| MemoryError::Template(error.to_string()))?;
    let rendered = template
        .render(minijinja::context! {
            term => factoid.term,
            fact => factoid.fact,
            supplier => factoid.provenance.supplier_name,
            learned_at => factoid.created_at.format("%Y-%m-%d %H:%M UTC").to_string(),
            permalink => permalink,
        })
        .map_err(|error| MemoryError::Template(error.to_string()))?;
    Ok(rendered)
}
