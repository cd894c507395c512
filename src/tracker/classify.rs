//! Error classification from handler output.
//!
//! Handlers can fail with anything; the runner turns that anything into
//! an [`ErrorRecord`] by matching the error text against an ordered
//! pattern table. First match wins, `Generic` is the fallback.

use regex::Regex;

use super::{ErrorKind, ErrorRecord};

/// Classifies handler failures based on error message analysis.
pub struct ErrorClassifier {
    /// Compiled regex patterns for classification.
    patterns: Vec<(Regex, ErrorKind)>,
}

impl ErrorClassifier {
    /// Create a classifier with the default patterns.
    #[must_use]
    pub fn new() -> Self {
        // Patterns ordered from most specific to least specific.
        let patterns = vec![
            // Archive/move failures
            (r"(?i)archiv", ErrorKind::Archive),
            (r"(?i)failed to move", ErrorKind::Archive),
            // Prompt/response shape problems
            (r"(?i)prompt", ErrorKind::PromptFormat),
            (r"(?i)malformed response", ErrorKind::PromptFormat),
            (r"(?i)unexpected (format|shape|field)", ErrorKind::PromptFormat),
            // Agent inactivity
            (r"(?i)inactiv", ErrorKind::Inactivity),
            (r"(?i)timed? ?out", ErrorKind::Inactivity),
            (r"(?i)no response", ErrorKind::Inactivity),
            (r"(?i)heartbeat", ErrorKind::Inactivity),
            // Devlog write failures
            (r"(?i)devlog", ErrorKind::DevlogWrite),
        ];

        let compiled = patterns
            .into_iter()
            .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|re| (re, kind)))
            .collect();

        Self { patterns: compiled }
    }

    /// Classify an error message into a kind.
    ///
    /// # Example
    ///
    /// ```
    /// use relay::tracker::{ErrorClassifier, ErrorKind};
    ///
    /// let classifier = ErrorClassifier::new();
    /// assert_eq!(classifier.classify("agent timed out"), ErrorKind::Inactivity);
    /// assert_eq!(classifier.classify("who knows"), ErrorKind::Generic);
    /// ```
    #[must_use]
    pub fn classify(&self, message: &str) -> ErrorKind {
        for (pattern, kind) in &self.patterns {
            if pattern.is_match(message) {
                return *kind;
            }
        }
        ErrorKind::Generic
    }

    /// Build an [`ErrorRecord`] for a handler failure, classified by the
    /// error's display chain and carrying the kind's default severity.
    #[must_use]
    pub fn record_for(&self, worker_id: &str, error: &anyhow::Error) -> ErrorRecord {
        let message = format!("{error:#}");
        let kind = self.classify(&message);
        ErrorRecord::new(worker_id, kind, message)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Severity;

    #[test]
    fn test_classify_archive() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("Archive error: could not compress"),
            ErrorKind::Archive
        );
        assert_eq!(
            classifier.classify("failed to move record into place"),
            ErrorKind::Archive
        );
    }

    #[test]
    fn test_classify_prompt_format() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("prompt missing required section"),
            ErrorKind::PromptFormat
        );
        assert_eq!(
            classifier.classify("unexpected format in agent reply"),
            ErrorKind::PromptFormat
        );
    }

    #[test]
    fn test_classify_inactivity() {
        let classifier = ErrorClassifier::new();
        assert_eq!(classifier.classify("request timed out"), ErrorKind::Inactivity);
        assert_eq!(classifier.classify("agent inactive for 10m"), ErrorKind::Inactivity);
        assert_eq!(classifier.classify("no response from worker"), ErrorKind::Inactivity);
    }

    #[test]
    fn test_classify_devlog() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("devlog write failed: disk full"),
            ErrorKind::DevlogWrite
        );
    }

    #[test]
    fn test_classify_fallback_generic() {
        let classifier = ErrorClassifier::new();
        assert_eq!(classifier.classify("something else entirely"), ErrorKind::Generic);
        assert_eq!(classifier.classify(""), ErrorKind::Generic);
    }

    #[test]
    fn test_ordering_most_specific_first() {
        // "archive prompt" hits the archive pattern before prompt.
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("archive prompt cleanup failed"),
            ErrorKind::Archive
        );
    }

    #[test]
    fn test_record_for_carries_default_severity() {
        let classifier = ErrorClassifier::new();
        let err = anyhow::anyhow!("prompt was malformed");
        let record = classifier.record_for("w1", &err);

        assert_eq!(record.worker_id, "w1");
        assert_eq!(record.kind, ErrorKind::PromptFormat);
        assert_eq!(record.severity, Severity::High);
        assert!(record.message.contains("malformed"));
    }

    #[test]
    fn test_record_for_includes_error_chain() {
        let classifier = ErrorClassifier::new();
        let root = anyhow::anyhow!("disk full");
        let err = root.context("devlog write failed");
        let record = classifier.record_for("w1", &err);

        assert_eq!(record.kind, ErrorKind::DevlogWrite);
        assert!(record.message.contains("disk full"));
    }
}
