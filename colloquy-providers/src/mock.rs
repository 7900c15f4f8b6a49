//! Scripted provider client for tests and offline runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use colloquy_core::error::{ProviderError, ProviderErrorKind};
use colloquy_core::message::estimate_tokens;
use colloquy_core::provider::{ProviderClient, ProviderInfo, ProviderMessage, ProviderReply};

type ScriptedStep = Result<String, ProviderError>;

/// A provider that replays a script of replies and failures. Once the
/// script runs dry it produces distinct filler text so loops under test
/// keep moving without tripping the repetition detector.
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    model: String,
    steps: Mutex<VecDeque<ScriptedStep>>,
    /// When set, an exhausted script keeps failing with this kind
    /// instead of producing filler.
    exhausted_failure: Mutex<Option<ProviderErrorKind>>,
    calls: AtomicU64,
    call_times: Mutex<Vec<Instant>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: "scripted-1".to_string(),
            steps: Mutex::new(VecDeque::new()),
            exhausted_failure: Mutex::new(None),
            calls: AtomicU64::new(0),
            call_times: Mutex::new(Vec::new()),
        }
    }

    /// Keep failing with `kind` once the script is exhausted.
    pub fn fail_forever(self, kind: ProviderErrorKind) -> Self {
        *self.exhausted_failure.lock().unwrap() = Some(kind);
        self
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.steps.lock().unwrap().push_back(Ok(text.into()));
        self
    }

    pub fn fail(self, kind: ProviderErrorKind) -> Self {
        let err = ProviderError::new(self.name.clone(), kind, format!("scripted {kind}"));
        self.steps.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn fail_with_retry_after(self, kind: ProviderErrorKind, wait: Duration) -> Self {
        let err = ProviderError::new(self.name.clone(), kind, format!("scripted {kind}"))
            .with_retry_after(wait);
        self.steps.lock().unwrap().push_back(Err(err));
        self
    }

    /// Total calls made so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Instants of every call, for backoff-timing assertions.
    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn call(&self, _messages: &[ProviderMessage]) -> Result<ProviderReply, ProviderError> {
        let call_index = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.call_times.lock().unwrap().push(Instant::now());

        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Ok(text)) => Ok(ProviderReply {
                input_tokens: 7,
                output_tokens: estimate_tokens(&text),
                text,
            }),
            Some(Err(err)) => Err(err),
            None => {
                if let Some(kind) = *self.exhausted_failure.lock().unwrap() {
                    return Err(ProviderError::new(
                        self.name.clone(),
                        kind,
                        format!("scripted {kind}"),
                    ));
                }
                let text = format!("{} has nothing further to add (call {call_index}).", self.name);
                Ok(ProviderReply {
                    input_tokens: 7,
                    output_tokens: estimate_tokens(&text),
                    text,
                })
            }
        }
    }

    fn describe(&self) -> ProviderInfo {
        ProviderInfo {
            provider: self.name.clone(),
            model: self.model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_script_then_produces_distinct_filler() {
        let provider = ScriptedProvider::new("claude")
            .reply("first scripted reply")
            .fail(ProviderErrorKind::Transient);

        let first = provider.call(&[]).await.expect("scripted reply");
        assert_eq!(first.text, "first scripted reply");
        assert!(first.output_tokens > 0);

        let err = provider.call(&[]).await.expect_err("scripted failure");
        assert_eq!(err.kind, ProviderErrorKind::Transient);

        let third = provider.call(&[]).await.expect("filler");
        let fourth = provider.call(&[]).await.expect("filler");
        assert_ne!(third.text, fourth.text);
        assert_eq!(provider.calls(), 4);
    }

    #[tokio::test]
    async fn retry_after_rides_along_on_failures() {
        let provider = ScriptedProvider::new("chatgpt")
            .fail_with_retry_after(ProviderErrorKind::RateLimited, Duration::from_millis(10));

        let err = provider.call(&[]).await.expect_err("rate limited");
        assert_eq!(err.retry_after, Some(Duration::from_millis(10)));
    }
}
