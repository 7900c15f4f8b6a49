//! Provider registry: name → credential key, default model, and client
//! construction. Every remote provider rides the OpenAI-compatible
//! completions surface, differing only in base URL and credential.

use std::sync::Arc;

use colloquy_core::error::ConfigError;
use colloquy_core::provider::ProviderClient;
use rig::client::CompletionClient;

use crate::rig_client::RigProviderClient;

/// Registry entry for one provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderSpec {
    /// Lowercase registry name, also the CLI identifier.
    pub name: &'static str,
    /// Canonical display name used as the transcript sender.
    pub display_name: &'static str,
    pub env_key: &'static str,
    pub default_model: &'static str,
    /// Environment key that overrides the default model.
    pub model_env_key: &'static str,
    /// OpenAI-compatible endpoint; `None` means the stock OpenAI URL.
    pub base_url: Option<&'static str>,
}

const REGISTRY: &[ProviderSpec] = &[
    ProviderSpec {
        name: "claude",
        display_name: "Claude",
        env_key: "ANTHROPIC_API_KEY",
        default_model: "claude-sonnet-4-5",
        model_env_key: "CLAUDE_MODEL",
        base_url: Some("https://api.anthropic.com/v1"),
    },
    ProviderSpec {
        name: "chatgpt",
        display_name: "ChatGPT",
        env_key: "OPENAI_API_KEY",
        default_model: "gpt-4o",
        model_env_key: "CHATGPT_MODEL",
        base_url: None,
    },
    ProviderSpec {
        name: "gemini",
        display_name: "Gemini",
        env_key: "GEMINI_API_KEY",
        default_model: "gemini-2.0-flash",
        model_env_key: "GEMINI_MODEL",
        base_url: Some("https://generativelanguage.googleapis.com/v1beta/openai"),
    },
    ProviderSpec {
        name: "grok",
        display_name: "Grok",
        env_key: "XAI_API_KEY",
        default_model: "grok-3",
        model_env_key: "GROK_MODEL",
        base_url: Some("https://api.x.ai/v1"),
    },
    ProviderSpec {
        name: "perplexity",
        display_name: "Perplexity",
        env_key: "PERPLEXITY_API_KEY",
        default_model: "sonar-pro",
        model_env_key: "PERPLEXITY_MODEL",
        base_url: Some("https://api.perplexity.ai"),
    },
];

/// All registered provider names, in registry order.
pub fn registered_providers() -> impl Iterator<Item = &'static ProviderSpec> {
    REGISTRY.iter()
}

/// Look up a provider by its registry name (case-insensitive).
pub fn provider_spec(name: &str) -> Result<&'static ProviderSpec, ConfigError> {
    let lower = name.trim().to_lowercase();
    REGISTRY
        .iter()
        .find(|spec| spec.name == lower)
        .ok_or_else(|| ConfigError::UnknownProvider(name.to_string()))
}

/// Providers whose credential is present in the environment.
pub fn detect_configured() -> Vec<&'static ProviderSpec> {
    REGISTRY
        .iter()
        .filter(|spec| {
            std::env::var(spec.env_key)
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false)
        })
        .collect()
}

/// Resolve the model for a spec: explicit override, then the model env
/// key, then the registry default.
pub fn resolve_model(spec: &ProviderSpec, explicit: Option<&str>) -> String {
    if let Some(model) = explicit {
        if !model.trim().is_empty() {
            return model.trim().to_string();
        }
    }
    std::env::var(spec.model_env_key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| spec.default_model.to_string())
}

/// Build a remote client for a registered provider. The credential comes
/// from the environment unless supplied explicitly.
pub fn build_client(
    name: &str,
    model: Option<&str>,
    api_key: Option<&str>,
    temperature: f64,
    max_tokens: u64,
) -> Result<Arc<dyn ProviderClient>, ConfigError> {
    let spec = provider_spec(name)?;
    let key = match api_key {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => std::env::var(spec.env_key).map_err(|_| ConfigError::MissingCredential {
            provider: spec.name.to_string(),
            env_key: spec.env_key.to_string(),
        })?,
    };
    let model_name = resolve_model(spec, model);

    let client = match spec.base_url {
        Some(url) => rig::providers::openai::Client::from_url(&key, url),
        None => rig::providers::openai::Client::new(&key),
    };

    tracing::debug!(provider = spec.name, model = %model_name, "provider_client_built");

    Ok(Arc::new(RigProviderClient::new(
        spec.name,
        model_name.clone(),
        client.completion_model(&model_name),
        temperature,
        max_tokens,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive_and_rejects_unknown_names() {
        assert_eq!(provider_spec("Claude").unwrap().display_name, "Claude");
        assert_eq!(provider_spec(" GROK ").unwrap().env_key, "XAI_API_KEY");
        assert!(matches!(
            provider_spec("skynet"),
            Err(ConfigError::UnknownProvider(_))
        ));
    }

    #[test]
    fn explicit_model_override_wins() {
        let spec = provider_spec("chatgpt").unwrap();
        assert_eq!(resolve_model(spec, Some("gpt-4o-mini")), "gpt-4o-mini");
        assert_eq!(resolve_model(spec, Some("   ")), spec.default_model);
    }

    #[test]
    fn build_client_without_credential_fails_cleanly() {
        // Use a registry entry whose env key is almost certainly unset.
        std::env::remove_var("PERPLEXITY_API_KEY");
        let err = build_client("perplexity", None, None, 0.7, 1024).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredential { .. }));
    }

    #[test]
    fn every_spec_has_distinct_name_and_display_name() {
        let mut names: Vec<_> = registered_providers().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), REGISTRY.len());
    }
}
