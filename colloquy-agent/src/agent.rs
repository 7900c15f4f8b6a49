//! The per-party agent loop.
//!
//! One cooperative task drives one participant from start to a terminal
//! condition: wait for the turn, read context, call the provider under
//! retry, sanitize and validate, detect termination signals and
//! repetition, and record the message against the shared transcript.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::Instrument;

use colloquy_core::config::ConversationConfig;
use colloquy_core::error::{ProviderError, ProviderErrorKind, TranscriptError};
use colloquy_core::message::{meta_keys, Message, SEED_SENDER};
use colloquy_core::provider::{role_for_sender, ProviderClient, ProviderMessage, ProviderReply, ProviderRole};
use colloquy_core::sanitize::{fingerprint, sanitize_content};
use colloquy_core::signals::TerminationSignals;
use colloquy_core::transcript::TranscriptStore;

use crate::backoff::{yield_delay, BackoffPolicy};
use crate::breaker::CircuitBreaker;
use crate::metrics::ConversationMetrics;
use crate::repetition::RepetitionDetector;

/// How one agent's loop ended.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub agent: String,
    pub turns: u32,
    pub exit_reason: String,
}

enum CallOutcome {
    Success {
        text: String,
        reply: ProviderReply,
        elapsed: Duration,
        context: Vec<Message>,
    },
    /// The breaker opened mid-retry; the terminal checks take it from here.
    CircuitOpen,
    Terminal(String),
}

enum AppendOutcome {
    Appended,
    /// Guarded append lost the race for the turn.
    Lost,
    Terminal(String),
}

pub struct AgentLoop {
    name: String,
    topic: String,
    provider: Arc<dyn ProviderClient>,
    store: Arc<dyn TranscriptStore>,
    /// Normalized names of every participant, self included.
    participants: Vec<String>,
    config: ConversationConfig,
    metrics: Arc<ConversationMetrics>,
    breaker: CircuitBreaker,
    repetition: RepetitionDetector,
    signals: TerminationSignals,
    backoff: BackoffPolicy,
    turn_count: u32,
    context_limit: usize,
    context_halved: bool,
    consecutive_store_errors: u32,
}

impl AgentLoop {
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        provider: Arc<dyn ProviderClient>,
        store: Arc<dyn TranscriptStore>,
        participants: Vec<String>,
        config: ConversationConfig,
        metrics: Arc<ConversationMetrics>,
    ) -> Self {
        let info = provider.describe();
        let breaker = CircuitBreaker::new(
            info.provider,
            config.breaker_failure_threshold,
            config.breaker_cooldown,
        );
        let repetition =
            RepetitionDetector::new(config.similarity_threshold, config.max_consecutive_similar);
        let signals = TerminationSignals::new(config.termination_phrases.iter().cloned());
        let backoff = BackoffPolicy::from_config(&config);
        let context_limit = config.max_context_msgs;

        Self {
            name: name.into(),
            topic: topic.into(),
            provider,
            store,
            participants,
            config,
            metrics,
            breaker,
            repetition,
            signals,
            backoff,
            turn_count: 0,
            context_limit,
            context_halved: false,
            consecutive_store_errors: 0,
        }
    }

    /// Drive this participant until a terminal condition is reached.
    pub async fn run(mut self) -> AgentOutcome {
        let deadline = Instant::now() + self.config.timeout;
        let info = self.provider.describe();
        tracing::info!(
            agent = %self.name,
            provider = %info.provider,
            model = %info.model,
            max_turns = self.config.max_turns,
            "agent_started"
        );

        let exit_reason = self.drive(deadline).await;

        tracing::info!(
            agent = %self.name,
            turns = self.turn_count,
            reason = %exit_reason,
            "agent_exited"
        );
        AgentOutcome {
            agent: self.name,
            turns: self.turn_count,
            exit_reason,
        }
    }

    async fn drive(&mut self, deadline: Instant) -> String {
        loop {
            // Terminal checks.
            match self.store.terminated().await {
                Ok(true) => return "peer_terminated".to_string(),
                Ok(false) => self.consecutive_store_errors = 0,
                Err(err) => {
                    if let Some(reason) = self.note_store_error(err).await {
                        return reason;
                    }
                    continue;
                }
            }
            if Instant::now() >= deadline {
                self.terminate("timeout").await;
                return "timeout".to_string();
            }
            if self.turn_count >= self.config.max_turns {
                self.terminate("max_turns_reached").await;
                return "max_turns_reached".to_string();
            }
            if self.breaker.is_open() {
                let reason = format!("circuit_open:{}", self.provider.describe().provider);
                self.terminate(&reason).await;
                return reason;
            }

            // Turn ownership.
            let observed = match self.store.last_sender().await {
                Ok(sender) => sender,
                Err(err) => {
                    if let Some(reason) = self.note_store_error(err).await {
                        return reason;
                    }
                    continue;
                }
            };
            if !self.my_turn(observed.as_deref()) {
                tokio::time::sleep(yield_delay()).await;
                continue;
            }

            // Context read and provider call, under retry.
            let (text, reply, elapsed, context) = match self.call_with_retry().await {
                CallOutcome::Success {
                    text,
                    reply,
                    elapsed,
                    context,
                } => (text, reply, elapsed, context),
                CallOutcome::CircuitOpen => continue,
                CallOutcome::Terminal(reason) => {
                    self.terminate(&reason).await;
                    return reason;
                }
            };

            // A peer may have ended the conversation while we were
            // generating; drop the response rather than append past the
            // termination.
            if matches!(self.store.terminated().await, Ok(true)) {
                return "peer_terminated".to_string();
            }

            // Record the message, CAS-guarded when strict.
            let expected = context.last().map(|m| m.sender.clone());
            match self.append_with_retry(&text, &reply, elapsed, expected.as_deref()).await {
                AppendOutcome::Appended => {}
                AppendOutcome::Lost => {
                    tokio::time::sleep(yield_delay()).await;
                    continue;
                }
                AppendOutcome::Terminal(reason) => return reason,
            }
            self.turn_count += 1;

            // Explicit termination phrase: the message is already
            // appended so peers see it; now end the conversation.
            if let Some(phrase) = self.signals.detect(&text) {
                tracing::info!(agent = %self.name, phrase = %phrase, "termination_phrase_detected");
                let reason = format!("explicit_termination:{}", self.name);
                self.terminate(&reason).await;
                return reason;
            }

            // Repetition check against own and peer-visible recent output.
            let peers: Vec<&str> = context
                .iter()
                .rev()
                .filter(|m| m.sender != self.name && m.sender != SEED_SENDER)
                .take(5)
                .map(|m| m.content.as_str())
                .collect();
            if self.repetition.observe(&text, peers) {
                let reason = format!("repetition_loop:{}", self.name);
                self.terminate(&reason).await;
                return reason;
            }
        }
    }

    /// Whether this agent may produce the next message given the
    /// observed last sender. The seeded opener (or an empty transcript)
    /// belongs to the participant whose name sorts first.
    fn my_turn(&self, observed: Option<&str>) -> bool {
        match observed {
            Some(sender) if sender == self.name => false,
            Some(sender) if sender == SEED_SENDER => self.first_mover(),
            Some(_) => true,
            None => self.first_mover(),
        }
    }

    fn first_mover(&self) -> bool {
        self.participants.iter().min().map(String::as_str) == Some(self.name.as_str())
    }

    async fn call_with_retry(&mut self) -> CallOutcome {
        let info = self.provider.describe();
        let mut failures = 0u32;

        loop {
            if self.breaker.is_open() {
                return CallOutcome::CircuitOpen;
            }

            let context = match self.store.context(self.context_limit).await {
                Ok(context) => {
                    self.consecutive_store_errors = 0;
                    context
                }
                Err(err) => {
                    if let Some(reason) = self.note_store_error(err).await {
                        return CallOutcome::Terminal(reason);
                    }
                    continue;
                }
            };
            let messages = self.build_provider_messages(&context);

            let span = tracing::info_span!(
                "provider_call",
                provider = %info.provider,
                model = %info.model,
                attempt = failures
            );
            let started = std::time::Instant::now();
            let result = match tokio::time::timeout(
                self.config.call_timeout,
                self.provider.call(&messages).instrument(span),
            )
            .await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(ProviderError::new(
                    info.provider.clone(),
                    ProviderErrorKind::Timeout,
                    format!("call exceeded {:?}", self.config.call_timeout),
                )),
            };
            let elapsed = started.elapsed();

            match result {
                Ok(reply) => {
                    let text = sanitize_content(&reply.text);
                    if text.is_empty() || text.len() > self.config.max_message_length {
                        // An unusable reply counts as a transient failure.
                        self.breaker.record_failure();
                        self.metrics.record_call(&info.provider, &info.model, "error");
                        self.metrics.record_error(&info.provider, "invalid_response");
                        tracing::warn!(
                            agent = %self.name,
                            length = text.len(),
                            "invalid_response"
                        );
                        failures += 1;
                        if failures >= self.config.max_retries {
                            return CallOutcome::Terminal(format!(
                                "invalid_response:{}",
                                info.provider
                            ));
                        }
                        tokio::time::sleep(self.backoff.jittered_delay(failures - 1)).await;
                        continue;
                    }

                    self.breaker.record_success();
                    self.metrics.record_call(&info.provider, &info.model, "success");
                    self.metrics
                        .observe_latency(&info.provider, &info.model, elapsed.as_secs_f64());
                    self.metrics.record_tokens(
                        &info.provider,
                        &info.model,
                        reply.input_tokens,
                        reply.output_tokens,
                    );
                    tracing::info!(
                        agent = %self.name,
                        tokens = reply.total_tokens(),
                        response_ms = elapsed.as_millis() as u64,
                        "response_generated"
                    );
                    return CallOutcome::Success {
                        text,
                        reply,
                        elapsed,
                        context,
                    };
                }
                Err(err) => {
                    self.breaker.record_failure();
                    self.metrics.record_call(&info.provider, &info.model, "error");
                    self.metrics.record_error(&info.provider, err.kind.as_str());
                    tracing::warn!(
                        agent = %self.name,
                        kind = %err.kind,
                        detail = %err.detail,
                        "provider_call_failed"
                    );

                    if err.kind == ProviderErrorKind::ContextTooLarge && !self.context_halved {
                        // One shot at a smaller context before giving up.
                        self.context_halved = true;
                        self.context_limit = (self.context_limit / 2).max(1);
                        failures += 1;
                        if failures >= self.config.max_retries {
                            return CallOutcome::Terminal(format!(
                                "context_too_large:{}",
                                info.provider
                            ));
                        }
                        continue;
                    }

                    if !err.is_retriable() {
                        let reason = match err.kind {
                            ProviderErrorKind::Auth | ProviderErrorKind::InvalidRequest => {
                                format!("configuration_error:{}", info.provider)
                            }
                            ProviderErrorKind::ContextTooLarge => {
                                format!("context_too_large:{}", info.provider)
                            }
                            _ => format!("provider_error:{}", info.provider),
                        };
                        return CallOutcome::Terminal(reason);
                    }

                    failures += 1;
                    if failures >= self.config.max_retries {
                        return CallOutcome::Terminal(format!(
                            "too_many_retries:{}",
                            info.provider
                        ));
                    }
                    let delay = err
                        .retry_after
                        .unwrap_or_else(|| self.backoff.jittered_delay(failures - 1));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn append_with_retry(
        &mut self,
        text: &str,
        reply: &ProviderReply,
        elapsed: Duration,
        expected_last_sender: Option<&str>,
    ) -> AppendOutcome {
        let info = self.provider.describe();
        let metadata = serde_json::json!({
            meta_keys::TOKENS: reply.total_tokens(),
            meta_keys::INPUT_TOKENS: reply.input_tokens,
            meta_keys::OUTPUT_TOKENS: reply.output_tokens,
            meta_keys::MODEL: info.model,
            meta_keys::TURN: self.turn_count + 1,
            meta_keys::RESPONSE_TIME_MS: elapsed.as_millis() as u64,
            meta_keys::FINGERPRINT: fingerprint(text),
        });
        let guard = self
            .config
            .strict_turn_guard
            .then_some(expected_last_sender);

        let mut failures = 0u32;
        loop {
            match self
                .store
                .append_guarded(&self.name, text, metadata.clone(), guard)
                .await
            {
                Ok(_message) => {
                    self.consecutive_store_errors = 0;
                    return AppendOutcome::Appended;
                }
                Err(TranscriptError::TurnViolation { observed, .. }) => {
                    tracing::info!(agent = %self.name, observed = ?observed, "turn_lost");
                    return AppendOutcome::Lost;
                }
                Err(TranscriptError::InvalidInput(detail)) => {
                    tracing::error!(agent = %self.name, detail = %detail, "internal_invariant");
                    self.terminate("internal_invariant").await;
                    return AppendOutcome::Terminal("internal_invariant".to_string());
                }
                Err(TranscriptError::Transient(detail))
                | Err(TranscriptError::Unavailable(detail)) => {
                    failures += 1;
                    tracing::warn!(
                        agent = %self.name,
                        detail = %detail,
                        attempt = failures,
                        "append_failed"
                    );
                    if failures >= self.config.max_retries {
                        self.terminate("store_unavailable").await;
                        return AppendOutcome::Terminal("store_unavailable".to_string());
                    }
                    tokio::time::sleep(self.backoff.jittered_delay(failures - 1)).await;
                }
            }
        }
    }

    fn build_provider_messages(&self, context: &[Message]) -> Vec<ProviderMessage> {
        let mut messages = Vec::with_capacity(context.len() + 1);
        messages.push(ProviderMessage::new(ProviderRole::System, self.system_prompt()));
        for message in context {
            messages.push(ProviderMessage::new(
                role_for_sender(&message.sender, &self.name, SEED_SENDER),
                message.content.clone(),
            ));
        }
        messages
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are {}. Topic: {}. Provide thoughtful, engaging responses.",
            self.name, self.topic
        )
    }

    /// Bounded handling of store faults outside the append path. Returns
    /// the exit reason once the store is considered gone.
    async fn note_store_error(&mut self, err: TranscriptError) -> Option<String> {
        match err {
            TranscriptError::InvalidInput(detail) => {
                tracing::error!(agent = %self.name, detail = %detail, "internal_invariant");
                self.terminate("internal_invariant").await;
                Some("internal_invariant".to_string())
            }
            TranscriptError::TurnViolation { .. } => None,
            TranscriptError::Transient(detail) | TranscriptError::Unavailable(detail) => {
                self.consecutive_store_errors += 1;
                tracing::warn!(
                    agent = %self.name,
                    detail = %detail,
                    attempt = self.consecutive_store_errors,
                    "store_error"
                );
                if self.consecutive_store_errors >= self.config.max_retries {
                    self.terminate("store_unavailable").await;
                    return Some("store_unavailable".to_string());
                }
                tokio::time::sleep(
                    self.backoff.jittered_delay(self.consecutive_store_errors - 1),
                )
                .await;
                None
            }
        }
    }

    /// Best-effort terminal mark; the conversation reason must not be
    /// lost to a store hiccup at shutdown.
    async fn terminate(&self, reason: &str) {
        if let Err(err) = self.store.mark_terminated(reason).await {
            tracing::warn!(
                agent = %self.name,
                reason = %reason,
                error = %err,
                "termination_mark_failed"
            );
        }
    }
}
