//! Word-shingle similarity used by the repetition detector.

use std::collections::HashSet;

const SHINGLE_WIDTH: usize = 3;

/// Jaccard similarity over 3-word shingles of the lowercased,
/// whitespace-split texts. Exact match after normalization
/// short-circuits to 1.0; either side empty yields 0.0. Deterministic.
pub fn shingle_similarity(a: &str, b: &str) -> f64 {
    let norm_a = a.trim().to_lowercase();
    let norm_b = b.trim().to_lowercase();
    if norm_a.is_empty() || norm_b.is_empty() {
        return 0.0;
    }
    if norm_a == norm_b {
        return 1.0;
    }

    let set_a = shingles(&norm_a);
    let set_b = shingles(&norm_b);
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    intersection as f64 / union as f64
}

/// Texts shorter than the shingle width degrade to a single whole-text
/// shingle, so near-identical short replies still score high.
fn shingles(normalized: &str) -> HashSet<String> {
    let words: Vec<&str> = normalized.split_whitespace().collect();
    if words.len() < SHINGLE_WIDTH {
        let mut set = HashSet::with_capacity(1);
        set.insert(normalized.to_string());
        return set;
    }
    words
        .windows(SHINGLE_WIDTH)
        .map(|w| w.join(" "))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_scores_one() {
        assert_eq!(shingle_similarity("I agree completely.", "i agree completely."), 1.0);
    }

    #[test]
    fn empty_side_scores_zero() {
        assert_eq!(shingle_similarity("", "something"), 0.0);
        assert_eq!(shingle_similarity("something", "   "), 0.0);
    }

    #[test]
    fn disjoint_text_scores_zero() {
        let sim = shingle_similarity(
            "the quick brown fox jumps over",
            "a completely different sentence entirely here",
        );
        assert_eq!(sim, 0.0);
    }

    #[test]
    fn overlapping_text_scores_between_zero_and_one() {
        let sim = shingle_similarity(
            "the quick brown fox jumps over the lazy dog",
            "the quick brown fox walks past the lazy dog",
        );
        assert!(sim > 0.0 && sim < 1.0, "got {sim}");
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let a = "repetition detection must be deterministic across calls";
        let b = "repetition detection should be deterministic across runs";
        assert_eq!(shingle_similarity(a, b), shingle_similarity(a, b));
    }
}
