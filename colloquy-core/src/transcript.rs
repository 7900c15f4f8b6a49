//! The transcript store contract: durable ordered log plus metadata bag,
//! with atomic append, atomic termination, and consistent context reads
//! under concurrent access.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TranscriptError;
use crate::message::Message;

/// Typed view of the conversation metadata bag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptMetadata {
    pub created_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_turns: u64,
    pub per_sender_turns: BTreeMap<String, u64>,
    pub total_tokens: u64,
    pub terminated: bool,
    pub termination_reason: Option<String>,
    pub termination_timestamp: Option<DateTime<Utc>>,
}

/// Full conversation dump: every message plus the metadata bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSnapshot {
    pub messages: Vec<Message>,
    pub metadata: TranscriptMetadata,
}

/// Result of a store health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    /// Named checks ("backend", "lock") mapped to "ok" or an error note.
    pub checks: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn new() -> Self {
        Self {
            healthy: true,
            checks: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn record(&mut self, check: &str, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => {
                self.checks.insert(check.to_string(), "ok".to_string());
            }
            Err(detail) => {
                self.checks.insert(check.to_string(), format!("error: {detail}"));
                self.healthy = false;
            }
        }
    }
}

impl Default for HealthReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable ordered message log shared by all agents of one conversation.
///
/// An append becomes observable to `last_sender`/`context` only once all
/// derived counters are updated; implementations serialize concurrent
/// appends into a total order.
#[async_trait::async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Validate, normalize, and atomically append a message, updating
    /// `total_turns`, the per-sender counter, and `total_tokens`.
    ///
    /// `expect_last_sender` arms the optional turn guard: when set, the
    /// append fails with [`TranscriptError::TurnViolation`] unless the
    /// sender of the highest-id message at commit time matches the
    /// expectation (`Some(None)` expects an empty transcript).
    async fn append_guarded(
        &self,
        sender: &str,
        content: &str,
        metadata: serde_json::Value,
        expect_last_sender: Option<Option<&str>>,
    ) -> Result<Message, TranscriptError>;

    /// Unguarded append; never fails with `TurnViolation`.
    async fn append(
        &self,
        sender: &str,
        content: &str,
        metadata: serde_json::Value,
    ) -> Result<Message, TranscriptError> {
        self.append_guarded(sender, content, metadata, None).await
    }

    /// Up to `limit` most-recent messages, oldest first. `limit >= 1`.
    async fn context(&self, limit: usize) -> Result<Vec<Message>, TranscriptError>;

    /// Sender of the highest-id message, or `None` when empty.
    async fn last_sender(&self) -> Result<Option<String>, TranscriptError>;

    /// Set the terminated flag. Idempotent: the first reason wins and
    /// later calls are no-ops.
    async fn mark_terminated(&self, reason: &str) -> Result<(), TranscriptError>;

    async fn terminated(&self) -> Result<bool, TranscriptError>;

    async fn termination_reason(&self) -> Result<Option<String>, TranscriptError>;

    /// Probe backend reachability and, where applicable, lock
    /// acquirability. Never errors; failures land in the report.
    async fn health(&self) -> HealthReport;

    /// Load the full conversation (messages in id order plus metadata).
    async fn snapshot(&self) -> Result<TranscriptSnapshot, TranscriptError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_report_records_failures() {
        let mut report = HealthReport::new();
        report.record("backend", Ok(()));
        report.record("lock", Err("timeout".into()));

        assert!(!report.healthy);
        assert_eq!(report.checks.get("backend").unwrap(), "ok");
        assert_eq!(report.checks.get("lock").unwrap(), "error: timeout");
    }
}
