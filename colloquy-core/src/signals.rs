//! Explicit termination-phrase detection.

/// Configured set of phrases that end a conversation when any of them
/// appears in an agent's output.
#[derive(Debug, Clone)]
pub struct TerminationSignals {
    phrases: Vec<String>,
}

impl TerminationSignals {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.into().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Case-insensitive substring match; returns the first configured
    /// phrase found in `content`.
    pub fn detect(&self, content: &str) -> Option<&str> {
        let lower = content.to_lowercase();
        self.phrases
            .iter()
            .find(|phrase| lower.contains(phrase.as_str()))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> TerminationSignals {
        TerminationSignals::new(crate::config::DEFAULT_TERMINATION_PHRASES.iter().copied())
    }

    #[test]
    fn detects_phrase_case_insensitively() {
        assert_eq!(signals().detect("Well then. [DONE] goodbye"), Some("[done]"));
        assert_eq!(
            signals().detect("I think this is the End Of Conversation now."),
            Some("end of conversation")
        );
    }

    #[test]
    fn no_match_on_ordinary_text() {
        assert_eq!(signals().detect("let us keep talking about ducks"), None);
    }

    #[test]
    fn empty_phrases_are_ignored() {
        let signals = TerminationSignals::new(vec!["", "[fin]"]);
        assert_eq!(signals.detect("and that is [fin]"), Some("[fin]"));
        assert_eq!(signals.detect("anything"), None);
    }
}
