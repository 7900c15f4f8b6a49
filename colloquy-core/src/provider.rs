//! The provider adapter contract.
//!
//! A provider adapter is the opaque remote LLM client: the engine hands
//! it an ordered chat context and gets back text plus token usage, or a
//! classified error. Concrete adapters live outside this crate.

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Role a transcript message plays in a provider chat request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    System,
    User,
    Assistant,
}

/// One entry of the chat context sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: ProviderRole,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: ProviderRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A successful provider completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReply {
    pub text: String,
    /// Token usage exactly as the provider reported it; providers that
    /// only report a total put it in `output_tokens` and leave
    /// `input_tokens` at 0.
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl ProviderReply {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Stable identity of an adapter, for logs and metrics labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub provider: String,
    pub model: String,
}

/// Abstraction over one remote LLM provider.
#[async_trait::async_trait]
pub trait ProviderClient: Send + Sync + std::fmt::Debug {
    /// Perform one completion call over the given chat context.
    async fn call(&self, messages: &[ProviderMessage]) -> Result<ProviderReply, ProviderError>;

    fn describe(&self) -> ProviderInfo;
}

/// Map a transcript sender to the role the provider sees: the agent's
/// own messages are `assistant`, the seed is `system`, everything else
/// (the peers) is `user`.
pub fn role_for_sender(sender: &str, self_name: &str, seed_sender: &str) -> ProviderRole {
    if sender == self_name {
        ProviderRole::Assistant
    } else if sender == seed_sender {
        ProviderRole::System
    } else {
        ProviderRole::User
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_to_role_mapping() {
        assert_eq!(role_for_sender("Claude", "Claude", "System"), ProviderRole::Assistant);
        assert_eq!(role_for_sender("ChatGPT", "Claude", "System"), ProviderRole::User);
        assert_eq!(role_for_sender("System", "Claude", "System"), ProviderRole::System);
    }

    #[test]
    fn total_tokens_sums_both_directions() {
        let reply = ProviderReply {
            text: "hi".into(),
            input_tokens: 10,
            output_tokens: 5,
        };
        assert_eq!(reply.total_tokens(), 15);
    }
}
