//! Conversation engine configuration.
//!
//! Resolved once from the environment at startup and threaded through
//! construction as an immutable value; nothing in the engine reads the
//! environment after this point.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_TERMINATION_PHRASES: &[&str] =
    &["[done]", "end of conversation", "goodbye and end"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Per-agent turn cap.
    pub max_turns: u32,
    /// Per-agent wall-clock deadline.
    pub timeout: Duration,
    /// Sampling temperature forwarded to provider adapters.
    pub temperature: f64,
    /// Per-call output token cap forwarded to provider adapters.
    pub max_tokens: u32,
    /// Context read limit (most-recent messages).
    pub max_context_msgs: usize,
    /// Repetition trigger threshold, in [0, 1].
    pub similarity_threshold: f64,
    /// Consecutive similar responses before the repetition loop fires.
    pub max_consecutive_similar: u32,
    /// Upper bound on stored message content, in bytes.
    pub max_message_length: usize,
    /// Upper bound on a single provider call; expiry is classified as a
    /// transient timeout.
    pub call_timeout: Duration,
    /// Retry policy: attempts per provider call / store append.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    /// Symmetric jitter applied to backoff and yield sleeps.
    pub jitter_range: f64,
    /// Consecutive provider failures that open an agent's breaker.
    pub breaker_failure_threshold: u32,
    /// How long an open breaker waits before probing again.
    pub breaker_cooldown: Duration,
    /// Permitted transcript root for file-backed stores.
    pub data_dir: PathBuf,
    /// Metrics exposition port; the HTTP surface itself lives outside the
    /// engine.
    pub metrics_port: u16,
    /// Case-insensitive substrings that end the conversation explicitly.
    pub termination_phrases: Vec<String>,
    /// When set, selects the networked Postgres backend.
    pub database_url: Option<String>,
    /// OTLP span export endpoint; tracing stays local when unset.
    pub otlp_endpoint: Option<String>,
    /// Enforce no-back-to-back-sender at the store via the CAS guard.
    pub strict_turn_guard: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: 50,
            timeout: Duration::from_secs(30 * 60),
            temperature: 0.7,
            max_tokens: 1024,
            max_context_msgs: 10,
            similarity_threshold: 0.85,
            max_consecutive_similar: 2,
            max_message_length: 100_000,
            call_timeout: Duration::from_secs(120),
            max_retries: 3,
            initial_backoff: Duration::from_secs_f64(2.0),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs_f64(120.0),
            jitter_range: 0.2,
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
            data_dir: PathBuf::from("./data"),
            metrics_port: 8000,
            termination_phrases: DEFAULT_TERMINATION_PHRASES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            database_url: None,
            otlp_endpoint: None,
            strict_turn_guard: true,
        }
    }
}

impl ConversationConfig {
    /// Resolve the configuration from the process environment, falling
    /// back to defaults for unset keys. Malformed values are collected
    /// and reported together.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut violations = Vec::new();
        let mut cfg = Self::default();

        parse_env("DEFAULT_MAX_TURNS", &mut cfg.max_turns, &mut violations);
        if let Some(minutes) = parse_env_opt::<u64>("DEFAULT_TIMEOUT_MINUTES", &mut violations) {
            cfg.timeout = Duration::from_secs(minutes * 60);
        }
        parse_env("TEMPERATURE", &mut cfg.temperature, &mut violations);
        parse_env("MAX_TOKENS", &mut cfg.max_tokens, &mut violations);
        parse_env("MAX_CONTEXT_MSGS", &mut cfg.max_context_msgs, &mut violations);
        parse_env(
            "SIMILARITY_THRESHOLD",
            &mut cfg.similarity_threshold,
            &mut violations,
        );
        parse_env(
            "MAX_CONSECUTIVE_SIMILAR",
            &mut cfg.max_consecutive_similar,
            &mut violations,
        );
        parse_env(
            "MAX_MESSAGE_LENGTH",
            &mut cfg.max_message_length,
            &mut violations,
        );
        if let Some(secs) = parse_env_opt::<u64>("CALL_TIMEOUT_SECONDS", &mut violations) {
            cfg.call_timeout = Duration::from_secs(secs);
        }
        parse_env("MAX_RETRIES", &mut cfg.max_retries, &mut violations);
        if let Some(secs) = parse_env_opt::<f64>("INITIAL_BACKOFF", &mut violations) {
            cfg.initial_backoff = Duration::from_secs_f64(secs.max(0.0));
        }
        parse_env(
            "BACKOFF_MULTIPLIER",
            &mut cfg.backoff_multiplier,
            &mut violations,
        );
        if let Some(secs) = parse_env_opt::<f64>("MAX_BACKOFF", &mut violations) {
            cfg.max_backoff = Duration::from_secs_f64(secs.max(0.0));
        }
        parse_env("JITTER_RANGE", &mut cfg.jitter_range, &mut violations);
        parse_env("METRICS_PORT", &mut cfg.metrics_port, &mut violations);

        if let Ok(dir) = std::env::var("DATA_DIR") {
            if !dir.trim().is_empty() {
                cfg.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(phrases) = std::env::var("TERMINATION_PHRASES") {
            let parsed: Vec<String> = phrases
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if !parsed.is_empty() {
                cfg.termination_phrases = parsed;
            }
        }
        cfg.database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());
        cfg.otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .filter(|v| !v.is_empty());
        if let Ok(strict) = std::env::var("STRICT_TURN_GUARD") {
            cfg.strict_turn_guard = strict != "0" && !strict.eq_ignore_ascii_case("false");
        }

        if !violations.is_empty() {
            return Err(ConfigError::Invalid { violations });
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Range-check every field, reporting all violations at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        if self.max_turns < 1 {
            violations.push("DEFAULT_MAX_TURNS must be >= 1".to_string());
        }
        if self.timeout.is_zero() {
            violations.push("DEFAULT_TIMEOUT_MINUTES must be >= 1".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            violations.push(format!("TEMPERATURE must be in [0, 2], got {}", self.temperature));
        }
        if self.max_tokens < 1 {
            violations.push("MAX_TOKENS must be >= 1".to_string());
        }
        if self.max_context_msgs < 1 {
            violations.push("MAX_CONTEXT_MSGS must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            violations.push(format!(
                "SIMILARITY_THRESHOLD must be in [0, 1], got {}",
                self.similarity_threshold
            ));
        }
        if self.max_consecutive_similar < 1 {
            violations.push("MAX_CONSECUTIVE_SIMILAR must be >= 1".to_string());
        }
        if self.max_message_length < 1 {
            violations.push("MAX_MESSAGE_LENGTH must be >= 1".to_string());
        }
        if self.call_timeout.is_zero() {
            violations.push("CALL_TIMEOUT_SECONDS must be >= 1".to_string());
        }
        if self.max_retries < 1 {
            violations.push("MAX_RETRIES must be >= 1".to_string());
        }
        if self.initial_backoff <= Duration::ZERO {
            violations.push("INITIAL_BACKOFF must be > 0".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            violations.push(format!(
                "BACKOFF_MULTIPLIER must be >= 1, got {}",
                self.backoff_multiplier
            ));
        }
        if self.max_backoff <= Duration::ZERO {
            violations.push("MAX_BACKOFF must be > 0".to_string());
        }
        if !(0.0..1.0).contains(&self.jitter_range) {
            violations.push(format!(
                "JITTER_RANGE must be in [0, 1), got {}",
                self.jitter_range
            ));
        }
        if self.breaker_failure_threshold < 1 {
            violations.push("breaker failure threshold must be >= 1".to_string());
        }
        if self.termination_phrases.is_empty() {
            violations.push("TERMINATION_PHRASES must not be empty".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { violations })
        }
    }

    /// Default transcript path under the permitted data root.
    pub fn default_db_path(&self) -> PathBuf {
        self.data_dir.join("shared_conversation.db")
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, slot: &mut T, violations: &mut Vec<String>) {
    if let Some(value) = parse_env_opt(key, violations) {
        *slot = value;
    }
}

fn parse_env_opt<T: std::str::FromStr>(key: &str, violations: &mut Vec<String>) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            violations.push(format!("{key} has unparseable value {raw:?}"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        ConversationConfig::default().validate().expect("defaults valid");
    }

    #[test]
    fn validation_collects_every_violation() {
        let cfg = ConversationConfig {
            temperature: 3.0,
            similarity_threshold: 1.5,
            backoff_multiplier: 0.5,
            ..ConversationConfig::default()
        };

        let err = cfg.validate().unwrap_err();
        match err {
            ConfigError::Invalid { violations } => {
                assert_eq!(violations.len(), 3);
                assert!(violations.iter().any(|v| v.contains("TEMPERATURE")));
                assert!(violations.iter().any(|v| v.contains("SIMILARITY_THRESHOLD")));
                assert!(violations.iter().any(|v| v.contains("BACKOFF_MULTIPLIER")));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn default_db_path_lives_under_data_dir() {
        let cfg = ConversationConfig::default();
        assert!(cfg.default_db_path().starts_with("./data"));
    }
}
