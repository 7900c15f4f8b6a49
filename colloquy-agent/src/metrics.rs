//! In-process conversation metrics.
//!
//! Concurrency-safe counters, a gauge, and a latency histogram with a
//! `snapshot()` accessor. The registry is passed explicitly to whoever
//! records into it; exposition over HTTP lives outside the engine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Upper bounds (seconds) of the latency histogram buckets; the last
/// bucket is unbounded.
const LATENCY_BUCKETS: [f64; 8] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];

#[derive(Debug, Default, Clone, Serialize)]
pub struct LatencyHistogram {
    /// Cumulative counts per bucket, plus one overflow bucket.
    pub buckets: Vec<u64>,
    pub count: u64,
    pub sum_seconds: f64,
}

impl LatencyHistogram {
    fn observe(&mut self, seconds: f64) {
        if self.buckets.is_empty() {
            self.buckets = vec![0; LATENCY_BUCKETS.len() + 1];
        }
        let slot = LATENCY_BUCKETS
            .iter()
            .position(|bound| seconds <= *bound)
            .unwrap_or(LATENCY_BUCKETS.len());
        self.buckets[slot] += 1;
        self.count += 1;
        self.sum_seconds += seconds;
    }
}

#[derive(Debug, Default)]
pub struct ConversationMetrics {
    /// (provider, model, status) → count.
    api_calls: Mutex<BTreeMap<String, u64>>,
    /// (provider, error kind) → count.
    errors: Mutex<BTreeMap<String, u64>>,
    /// (provider, model, direction) → token total.
    tokens: Mutex<BTreeMap<String, u64>>,
    /// (provider, model) → latency histogram.
    latency: Mutex<BTreeMap<String, LatencyHistogram>>,
    active_conversations: AtomicI64,
}

/// Point-in-time copy of every metric, keyed by `:`-joined labels.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub api_calls: BTreeMap<String, u64>,
    pub errors: BTreeMap<String, u64>,
    pub tokens: BTreeMap<String, u64>,
    pub latency: BTreeMap<String, LatencyHistogram>,
    pub active_conversations: i64,
}

impl ConversationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, provider: &str, model: &str, status: &str) {
        let key = format!("{provider}:{model}:{status}");
        *self.api_calls.lock().unwrap().entry(key).or_insert(0) += 1;
    }

    pub fn record_error(&self, provider: &str, error_kind: &str) {
        let key = format!("{provider}:{error_kind}");
        *self.errors.lock().unwrap().entry(key).or_insert(0) += 1;
    }

    pub fn record_tokens(&self, provider: &str, model: &str, input: u64, output: u64) {
        let mut tokens = self.tokens.lock().unwrap();
        *tokens.entry(format!("{provider}:{model}:input")).or_insert(0) += input;
        *tokens.entry(format!("{provider}:{model}:output")).or_insert(0) += output;
    }

    pub fn observe_latency(&self, provider: &str, model: &str, seconds: f64) {
        self.latency
            .lock()
            .unwrap()
            .entry(format!("{provider}:{model}"))
            .or_default()
            .observe(seconds);
    }

    pub fn increment_active_conversations(&self) {
        self.active_conversations.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_active_conversations(&self) {
        self.active_conversations.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            api_calls: self.api_calls.lock().unwrap().clone(),
            errors: self.errors.lock().unwrap().clone(),
            tokens: self.tokens.lock().unwrap().clone(),
            latency: self.latency.lock().unwrap().clone(),
            active_conversations: self.active_conversations.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let metrics = ConversationMetrics::new();
        metrics.record_call("claude", "sonnet", "success");
        metrics.record_call("claude", "sonnet", "success");
        metrics.record_call("claude", "sonnet", "error");
        metrics.record_tokens("claude", "sonnet", 100, 40);
        metrics.record_tokens("claude", "sonnet", 50, 10);
        metrics.record_error("claude", "rate_limited");

        let snap = metrics.snapshot();
        assert_eq!(snap.api_calls.get("claude:sonnet:success"), Some(&2));
        assert_eq!(snap.api_calls.get("claude:sonnet:error"), Some(&1));
        assert_eq!(snap.tokens.get("claude:sonnet:input"), Some(&150));
        assert_eq!(snap.tokens.get("claude:sonnet:output"), Some(&50));
        assert_eq!(snap.errors.get("claude:rate_limited"), Some(&1));
    }

    #[test]
    fn latency_lands_in_the_right_bucket() {
        let metrics = ConversationMetrics::new();
        metrics.observe_latency("gemini", "flash", 0.05);
        metrics.observe_latency("gemini", "flash", 1.5);
        metrics.observe_latency("gemini", "flash", 90.0);

        let snap = metrics.snapshot();
        let histogram = snap.latency.get("gemini:flash").expect("histogram");
        assert_eq!(histogram.count, 3);
        assert_eq!(histogram.buckets[0], 1);
        assert_eq!(histogram.buckets[3], 1);
        assert_eq!(histogram.buckets[LATENCY_BUCKETS.len()], 1);
        assert!((histogram.sum_seconds - 91.55).abs() < 1e-9);
    }

    #[test]
    fn gauge_tracks_active_conversations() {
        let metrics = ConversationMetrics::new();
        metrics.increment_active_conversations();
        metrics.increment_active_conversations();
        metrics.decrement_active_conversations();
        assert_eq!(metrics.snapshot().active_conversations, 1);
    }
}
