//! Conversation runner: seeds the opener, launches one agent loop per
//! participant, awaits them all, and assembles the final report.

use std::collections::BTreeMap;
use std::sync::Arc;

use colloquy_core::config::ConversationConfig;
use colloquy_core::error::{ConfigError, TranscriptError};
use colloquy_core::message::{normalize_sender, SEED_SENDER};
use colloquy_core::provider::ProviderClient;
use colloquy_core::transcript::TranscriptStore;

use crate::agent::{AgentLoop, AgentOutcome};
use crate::metrics::ConversationMetrics;

/// One participant: a display name bound to a provider adapter.
pub struct AgentSpec {
    pub name: String,
    pub provider: Arc<dyn ProviderClient>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, provider: Arc<dyn ProviderClient>) -> Self {
        Self {
            name: name.into(),
            provider,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("transcript store unhealthy: {0}")]
    StoreUnhealthy(String),

    #[error("transcript store failed: {0}")]
    Store(#[from] TranscriptError),
}

/// Final state of a finished conversation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunReport {
    pub reason: String,
    pub total_turns: u64,
    pub per_sender_turns: BTreeMap<String, u64>,
    pub total_tokens: u64,
    pub agent_turns: BTreeMap<String, u32>,
}

pub struct ConversationRunner {
    store: Arc<dyn TranscriptStore>,
    config: ConversationConfig,
    topic: String,
    agents: Vec<AgentSpec>,
    metrics: Arc<ConversationMetrics>,
}

impl ConversationRunner {
    /// Validate the configuration and participant set. At least two
    /// agents with distinct normalized names are required.
    pub fn new(
        store: Arc<dyn TranscriptStore>,
        config: ConversationConfig,
        topic: impl Into<String>,
        agents: Vec<AgentSpec>,
        metrics: Arc<ConversationMetrics>,
    ) -> Result<Self, RunnerError> {
        config.validate()?;

        let topic = topic.into();
        let mut violations = Vec::new();
        if topic.trim().is_empty() {
            violations.push("topic must not be empty".to_string());
        }
        if agents.len() < 2 {
            violations.push(format!(
                "need at least two agents, got {}",
                agents.len()
            ));
        }

        let mut normalized = Vec::with_capacity(agents.len());
        for agent in &agents {
            match normalize_sender(&agent.name) {
                Some(name) if name == SEED_SENDER => {
                    violations.push(format!("agent name {name:?} is reserved"));
                }
                Some(name) => normalized.push(name),
                None => violations.push("agent names must not be empty".to_string()),
            }
        }
        normalized.sort_unstable();
        let before = normalized.len();
        normalized.dedup();
        if normalized.len() != before {
            violations.push("agent names must be distinct".to_string());
        }

        if !violations.is_empty() {
            return Err(RunnerError::Config(ConfigError::Invalid { violations }));
        }

        Ok(Self {
            store,
            config,
            topic,
            agents,
            metrics,
        })
    }

    /// Run the conversation to completion and report how it ended.
    pub async fn run(self) -> Result<RunReport, RunnerError> {
        let health = self.store.health().await;
        if !health.healthy {
            let detail: Vec<String> = health
                .checks
                .iter()
                .map(|(check, outcome)| format!("{check}={outcome}"))
                .collect();
            return Err(RunnerError::StoreUnhealthy(detail.join(", ")));
        }

        self.seed_if_empty().await?;

        let participants: Vec<String> = self
            .agents
            .iter()
            .filter_map(|a| normalize_sender(&a.name))
            .collect();

        self.metrics.increment_active_conversations();
        tracing::info!(
            agents = participants.len(),
            topic = %self.topic,
            "conversation_started"
        );

        let mut handles = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            let name = normalize_sender(&agent.name).unwrap_or_else(|| agent.name.clone());
            let agent_loop = AgentLoop::new(
                name,
                self.topic.clone(),
                Arc::clone(&agent.provider),
                Arc::clone(&self.store),
                participants.clone(),
                self.config.clone(),
                Arc::clone(&self.metrics),
            );
            handles.push(tokio::spawn(agent_loop.run()));
        }

        let mut outcomes: Vec<AgentOutcome> = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => {
                    // Never strand the surviving agents: flag the fatal
                    // so their terminal checks observe it.
                    let reason = format!("fatal:{join_err}");
                    tracing::error!(error = %join_err, "agent_task_failed");
                    if let Err(err) = self.store.mark_terminated(&reason).await {
                        tracing::warn!(error = %err, "termination_mark_failed");
                    }
                }
            }
        }

        self.metrics.decrement_active_conversations();

        let snapshot = self.store.snapshot().await?;
        let reason = snapshot
            .metadata
            .termination_reason
            .clone()
            .unwrap_or_else(|| "completed".to_string());

        tracing::info!(
            reason = %reason,
            total_turns = snapshot.metadata.total_turns,
            total_tokens = snapshot.metadata.total_tokens,
            "conversation_finished"
        );

        Ok(RunReport {
            reason,
            total_turns: snapshot.metadata.total_turns,
            per_sender_turns: snapshot.metadata.per_sender_turns,
            total_tokens: snapshot.metadata.total_tokens,
            agent_turns: outcomes
                .into_iter()
                .map(|o| (o.agent, o.turns))
                .collect(),
        })
    }

    /// Break the start-turn race: an empty transcript gets a synthetic
    /// opener whose sender matches no agent, so the first mover is
    /// well-defined for everyone.
    async fn seed_if_empty(&self) -> Result<(), TranscriptError> {
        if self.store.last_sender().await?.is_some() {
            return Ok(());
        }
        let content = format!("Topic: {}. Begin.", self.topic);
        self.store
            .append(SEED_SENDER, &content, serde_json::json!({ "seed": true }))
            .await?;
        tracing::info!(topic = %self.topic, "conversation_seeded");
        Ok(())
    }
}
