//! Repetition-loop detection over a rolling window of recent outputs.

use std::collections::VecDeque;

use colloquy_core::similarity::shingle_similarity;

const WINDOW_SIZE: usize = 5;

#[derive(Debug)]
pub struct RepetitionDetector {
    similarity_threshold: f64,
    max_consecutive_similar: u32,
    recent: VecDeque<String>,
    consecutive_similar: u32,
}

impl RepetitionDetector {
    pub fn new(similarity_threshold: f64, max_consecutive_similar: u32) -> Self {
        Self {
            similarity_threshold,
            max_consecutive_similar: max_consecutive_similar.max(1),
            recent: VecDeque::with_capacity(WINDOW_SIZE),
            consecutive_similar: 0,
        }
    }

    /// Feed one new output together with the peer-visible recent
    /// responses. Returns true when the repetition loop fires and the
    /// conversation should end. Deterministic for the same inputs.
    pub fn observe<'a, I>(&mut self, candidate: &str, peer_recent: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let max_sim_recent = self
            .recent
            .iter()
            .map(String::as_str)
            .map(|previous| shingle_similarity(candidate, previous))
            .fold(0.0_f64, f64::max);
        let max_sim_peer = peer_recent
            .into_iter()
            .map(|previous| shingle_similarity(candidate, previous))
            .fold(0.0_f64, f64::max);
        let max_sim = max_sim_recent.max(max_sim_peer);

        if max_sim >= self.similarity_threshold {
            self.consecutive_similar += 1;
        } else {
            self.consecutive_similar = 0;
        }

        if self.recent.len() == WINDOW_SIZE {
            self.recent.pop_front();
        }
        self.recent.push_back(candidate.to_string());

        if self.consecutive_similar >= self.max_consecutive_similar {
            tracing::warn!(
                consecutive = self.consecutive_similar,
                max_similarity = max_sim,
                "repetition_loop_detected"
            );
            return true;
        }
        false
    }

    pub fn consecutive_similar(&self) -> u32 {
        self.consecutive_similar
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_repeats_trigger_after_the_configured_count() {
        let mut detector = RepetitionDetector::new(0.85, 2);

        assert!(!detector.observe("I agree completely.", []));
        assert_eq!(detector.consecutive_similar(), 0);

        assert!(!detector.observe("I agree completely.", []));
        assert_eq!(detector.consecutive_similar(), 1);

        assert!(detector.observe("I agree completely.", []));
        assert_eq!(detector.consecutive_similar(), 2);
    }

    #[test]
    fn dissimilar_output_resets_the_streak() {
        let mut detector = RepetitionDetector::new(0.85, 2);
        assert!(!detector.observe("the weather is lovely today", []));
        assert!(!detector.observe("the weather is lovely today", []));
        assert_eq!(detector.consecutive_similar(), 1);

        assert!(!detector.observe("completely unrelated topic now entirely", []));
        assert_eq!(detector.consecutive_similar(), 0);
    }

    #[test]
    fn similarity_to_a_peer_response_counts() {
        let mut detector = RepetitionDetector::new(0.85, 1);
        let peer = "we have reached a firm conclusion here";
        assert!(detector.observe("we have reached a firm conclusion here", [peer]));
    }

    #[test]
    fn window_is_bounded() {
        let mut detector = RepetitionDetector::new(0.99, 99);
        for i in 0..10 {
            detector.observe(&format!("unique message number {i} with filler words"), []);
        }
        assert!(detector.recent.len() <= WINDOW_SIZE);
    }

    #[test]
    fn deterministic_for_the_same_input_sequence() {
        let run = || {
            let mut detector = RepetitionDetector::new(0.85, 2);
            let mut fired = Vec::new();
            for text in ["alpha beta gamma delta", "alpha beta gamma delta", "alpha beta gamma delta"] {
                fired.push(detector.observe(text, []));
            }
            fired
        };
        assert_eq!(run(), run());
    }
}
