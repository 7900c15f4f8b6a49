//! rig-backed provider client.
//!
//! Wraps any rig `CompletionModel` behind the engine's
//! [`ProviderClient`] contract: transcript roles map onto a system
//! preamble plus chat history, and the reply comes back with token
//! usage estimated from content length (rig's completion response does
//! not expose provider usage numbers).

use async_trait::async_trait;

use colloquy_core::error::ProviderError;
use colloquy_core::message::estimate_tokens;
use colloquy_core::provider::{
    ProviderClient, ProviderInfo, ProviderMessage, ProviderReply, ProviderRole,
};

use crate::classify::classify_error;

pub struct RigProviderClient<M: rig::completion::CompletionModel> {
    provider: String,
    model_name: String,
    model: M,
    temperature: f64,
    max_tokens: u64,
}

impl<M: rig::completion::CompletionModel> std::fmt::Debug for RigProviderClient<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RigProviderClient")
            .field("provider", &self.provider)
            .field("model_name", &self.model_name)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl<M: rig::completion::CompletionModel> RigProviderClient<M> {
    pub fn new(
        provider: impl Into<String>,
        model_name: impl Into<String>,
        model: M,
        temperature: f64,
        max_tokens: u64,
    ) -> Self {
        Self {
            provider: provider.into(),
            model_name: model_name.into(),
            model,
            temperature,
            max_tokens,
        }
    }
}

#[async_trait]
impl<M> ProviderClient for RigProviderClient<M>
where
    M: rig::completion::CompletionModel + Send + Sync + 'static,
    M::Response: Send + Sync,
{
    async fn call(&self, messages: &[ProviderMessage]) -> Result<ProviderReply, ProviderError> {
        let (preamble, prompt, history) = split_context(messages);
        let input_estimate: u64 = messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum();

        let request = self
            .model
            .completion_request(rig::completion::Message::user(prompt))
            .preamble(preamble)
            .messages(history)
            .temperature(self.temperature)
            .max_tokens(self.max_tokens)
            .build();

        let response = self
            .model
            .completion(request)
            .await
            .map_err(|err| classify_error(&self.provider, err))?;

        let mut text = String::new();
        for content in response.choice.iter() {
            if let rig::message::AssistantContent::Text(t) = content {
                text.push_str(&t.text);
            }
        }

        Ok(ProviderReply {
            input_tokens: input_estimate,
            output_tokens: estimate_tokens(&text),
            text,
        })
    }

    fn describe(&self) -> ProviderInfo {
        ProviderInfo {
            provider: self.provider.clone(),
            model: self.model_name.clone(),
        }
    }
}

/// Split the engine's ordered context into rig's shape: system entries
/// join into the preamble, the last user entry becomes the prompt, and
/// everything else is chat history.
fn split_context(
    messages: &[ProviderMessage],
) -> (String, String, Vec<rig::completion::Message>) {
    let mut preamble_parts: Vec<&str> = Vec::new();
    let mut chat: Vec<(ProviderRole, &str)> = Vec::new();

    for message in messages {
        match message.role {
            ProviderRole::System => preamble_parts.push(&message.content),
            role => chat.push((role, &message.content)),
        }
    }

    let prompt = match chat.last() {
        Some((ProviderRole::User, content)) => {
            let content = content.to_string();
            chat.pop();
            content
        }
        // The peer has not spoken yet; prompt the model to open.
        _ => "Please continue the conversation.".to_string(),
    };

    let history = chat
        .into_iter()
        .map(|(role, content)| match role {
            ProviderRole::Assistant => rig::completion::Message::assistant(content),
            _ => rig::completion::Message::user(content),
        })
        .collect();

    (preamble_parts.join("\n\n"), prompt, history)
}
