use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ColloquyError {
    #[error("transcript error: {0}")]
    Transcript(#[from] TranscriptError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Faults surfaced by a transcript store.
#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    /// Caller violated a precondition; fatal for the call, not the store.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The guarded append observed a different last sender than expected.
    #[error("turn violation: {sender} attempted to follow {observed:?}")]
    TurnViolation {
        sender: String,
        observed: Option<String>,
    },

    /// Retryable backend fault (busy database, network blip).
    #[error("transient store fault: {0}")]
    Transient(String),

    /// The backend cannot be reached at all.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Classification of a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimited,
    Transient,
    Timeout,
    InvalidRequest,
    Auth,
    ContextTooLarge,
    Unknown,
}

impl ProviderErrorKind {
    /// Default retry classification, used only when the adapter left
    /// `retriable` unset.
    pub fn default_retriable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Transient | Self::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::InvalidRequest => "invalid_request",
            Self::Auth => "auth",
            Self::ContextTooLarge => "context_too_large",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call to a provider adapter.
#[derive(Debug, thiserror::Error)]
#[error("{kind} from {provider}: {detail}")]
pub struct ProviderError {
    pub provider: String,
    pub kind: ProviderErrorKind,
    /// Adapter-supplied retry classification; `None` falls back to the
    /// kind's default.
    pub retriable: Option<bool>,
    /// Mandatory wait before the next attempt (e.g. a Retry-After header).
    pub retry_after: Option<Duration>,
    pub detail: String,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, kind: ProviderErrorKind, detail: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            kind,
            retriable: None,
            retry_after: None,
            detail: detail.into(),
        }
    }

    pub fn with_retriable(mut self, retriable: bool) -> Self {
        self.retriable = Some(retriable);
        self
    }

    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }

    pub fn is_retriable(&self) -> bool {
        self.retriable.unwrap_or_else(|| self.kind.default_retriable())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A shared-state invariant the loop relies on was violated.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    /// The store stayed down past the bounded retry budget.
    #[error("store unavailable after retries: {0}")]
    StoreUnavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {}", violations.join("; "))]
    Invalid { violations: Vec<String> },

    #[error("missing credential for {provider}: set {env_key}")]
    MissingCredential { provider: String, env_key: String },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_falls_back_to_kind_classification() {
        let err = ProviderError::new("chatgpt", ProviderErrorKind::RateLimited, "429");
        assert!(err.is_retriable());

        let err = ProviderError::new("chatgpt", ProviderErrorKind::Auth, "401");
        assert!(!err.is_retriable());
    }

    #[test]
    fn adapter_classification_overrides_default() {
        let err = ProviderError::new("gemini", ProviderErrorKind::Unknown, "hiccup")
            .with_retriable(true);
        assert!(err.is_retriable());
    }

    #[test]
    fn turn_violation_formats_observed_sender() {
        let err = TranscriptError::TurnViolation {
            sender: "Claude".into(),
            observed: Some("Claude".into()),
        };
        assert!(err.to_string().contains("Claude"));
    }
}
