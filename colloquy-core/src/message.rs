//! Transcript message model and sender normalization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known metadata keys carried on a message. The bag is open; these
/// are the keys the engine itself reads or writes.
pub mod meta_keys {
    pub const TOKENS: &str = "tokens";
    pub const INPUT_TOKENS: &str = "input_tokens";
    pub const OUTPUT_TOKENS: &str = "output_tokens";
    pub const MODEL: &str = "model";
    pub const TURN: &str = "turn";
    pub const RESPONSE_TIME_MS: &str = "response_time_ms";
    pub const FINGERPRINT: &str = "fingerprint";
    pub const SEED: &str = "seed";
}

/// One stored message of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Monotonically increasing within a conversation; gaps permitted.
    pub id: i64,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub fingerprint: String,
    /// Opaque keyed bag; see [`meta_keys`] for the well-known entries.
    pub metadata: serde_json::Value,
}

impl Message {
    /// Token count recorded by the appender, 0 when absent.
    pub fn tokens(&self) -> u64 {
        self.metadata
            .get(meta_keys::TOKENS)
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    }

    /// Whether this is the runner's synthetic opener.
    pub fn is_seed(&self) -> bool {
        self.metadata
            .get(meta_keys::SEED)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// Sender name of the runner's synthetic opener message.
pub const SEED_SENDER: &str = "System";

/// Rough token estimate for adapters that do not report usage:
/// ~4 bytes per token, never zero.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4).max(1)
}

/// Canonical display casing for the built-in provider names.
const SENDER_ALIASES: &[(&str, &str)] = &[
    ("claude", "Claude"),
    ("chatgpt", "ChatGPT"),
    ("gemini", "Gemini"),
    ("grok", "Grok"),
    ("perplexity", "Perplexity"),
    ("system", "System"),
];

/// Normalize a sender name: trim, map known aliases to their canonical
/// casing, otherwise upper-case the first letter. Returns `None` for an
/// empty name.
pub fn normalize_sender(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let lower = trimmed.to_lowercase();
    for (alias, canonical) in SENDER_ALIASES {
        if lower == *alias {
            return Some((*canonical).to_string());
        }
    }

    let mut chars = trimmed.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_aliases_map_to_canonical_casing() {
        assert_eq!(normalize_sender("claude").as_deref(), Some("Claude"));
        assert_eq!(normalize_sender("  ChatGPT ").as_deref(), Some("ChatGPT"));
        assert_eq!(normalize_sender("SYSTEM").as_deref(), Some("System"));
    }

    #[test]
    fn unknown_senders_get_first_letter_uppercased() {
        assert_eq!(normalize_sender("simulator").as_deref(), Some("Simulator"));
        assert_eq!(normalize_sender("éclair").as_deref(), Some("Éclair"));
    }

    #[test]
    fn empty_sender_is_rejected() {
        assert_eq!(normalize_sender("   "), None);
        assert_eq!(normalize_sender(""), None);
    }

    #[test]
    fn seed_flag_and_tokens_read_from_metadata() {
        let msg = Message {
            id: 1,
            sender: "System".into(),
            content: "Topic: x. Begin.".into(),
            timestamp: Utc::now(),
            fingerprint: "0".repeat(16),
            metadata: serde_json::json!({ "seed": true, "tokens": 12 }),
        };
        assert!(msg.is_seed());
        assert_eq!(msg.tokens(), 12);
    }
}
