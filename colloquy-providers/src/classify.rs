//! Error-kind classification for provider faults.
//!
//! rig surfaces provider failures as strings; this maps them onto the
//! engine's error kinds, with credentials masked before the detail ever
//! reaches a log line. Adapters that know better set `retriable`
//! themselves.

use colloquy_core::error::{ProviderError, ProviderErrorKind};
use colloquy_core::sanitize::mask_credentials;

/// Build a classified [`ProviderError`] from a raw failure string.
pub fn classify_error(provider: &str, detail: impl std::fmt::Display) -> ProviderError {
    let detail = mask_credentials(&detail.to_string());
    let kind = classify_detail(&detail);
    ProviderError::new(provider, kind, detail)
}

fn classify_detail(detail: &str) -> ProviderErrorKind {
    let lower = detail.to_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if has("429") || has("rate limit") || has("rate_limit") {
        ProviderErrorKind::RateLimited
    } else if has("timeout") || has("timed out") {
        ProviderErrorKind::Timeout
    } else if has("401") || has("403") || has("unauthorized") || has("forbidden")
        || has("invalid api key") || has("invalid x-api-key")
    {
        ProviderErrorKind::Auth
    } else if has("context length") || has("context_length") || has("maximum context")
        || has("too many tokens") || has("prompt is too long")
    {
        ProviderErrorKind::ContextTooLarge
    } else if has("400") || has("404") || has("not found") || has("invalid_request") {
        ProviderErrorKind::InvalidRequest
    } else if has("500") || has("502") || has("503") || has("529") || has("overloaded")
        || has("connection") || has("unavailable")
    {
        ProviderErrorKind::Transient
    } else {
        ProviderErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_timeouts_classify_retriable() {
        let err = classify_error("chatgpt", "HTTP 429: rate limit exceeded");
        assert_eq!(err.kind, ProviderErrorKind::RateLimited);
        assert!(err.is_retriable());

        let err = classify_error("gemini", "request timed out after 30s");
        assert_eq!(err.kind, ProviderErrorKind::Timeout);
        assert!(err.is_retriable());
    }

    #[test]
    fn auth_and_bad_request_are_fatal() {
        let err = classify_error("claude", "401 Unauthorized: invalid x-api-key");
        assert_eq!(err.kind, ProviderErrorKind::Auth);
        assert!(!err.is_retriable());

        let err = classify_error("grok", "model not found");
        assert_eq!(err.kind, ProviderErrorKind::InvalidRequest);
        assert!(!err.is_retriable());
    }

    #[test]
    fn context_overflow_is_its_own_kind() {
        let err = classify_error("claude", "prompt is too long: maximum context exceeded");
        assert_eq!(err.kind, ProviderErrorKind::ContextTooLarge);
    }

    #[test]
    fn unrecognized_details_are_unknown_and_not_retried() {
        let err = classify_error("perplexity", "weird inexplicable failure");
        assert_eq!(err.kind, ProviderErrorKind::Unknown);
        assert!(!err.is_retriable());
    }

    #[test]
    fn credentials_are_masked_in_the_detail() {
        let err = classify_error(
            "chatgpt",
            "401 unauthorized for key sk-abcdefghijklmnopqrstuvwx",
        );
        assert!(err.detail.contains("[OPENAI_KEY]"));
        assert!(!err.detail.contains("sk-abc"));
    }
}
