//! Content screening capability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of a content check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    /// Whether the text may proceed.
    pub is_safe: bool,

    /// Human-readable explanation, surfaced verbatim on rejection.
    pub reason: String,
}

impl SafetyVerdict {
    /// A passing verdict.
    pub fn safe() -> Self {
        Self {
            is_safe: true,
            reason: "input accepted".to_string(),
        }
    }

    /// A failing verdict with the given reason.
    pub fn unsafe_because(reason: impl Into<String>) -> Self {
        Self {
            is_safe: false,
            reason: reason.into(),
        }
    }
}

/// The checker itself could not produce a verdict.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SafetyCheckError(pub String);

/// Screens user input before it reaches the rest of the pipeline.
#[async_trait]
pub trait SafetyChecker: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Decide whether `text` is acceptable.
    async fn check(&self, text: &str) -> Result<SafetyVerdict, SafetyCheckError>;
}

/// Rejects text containing any configured term.
///
/// Single-word terms match whole words case-insensitively; terms containing
/// spaces match as case-insensitive substrings.
#[derive(Debug, Clone)]
pub struct KeywordSafetyChecker {
    terms: Vec<String>,
    reason: String,
}

impl KeywordSafetyChecker {
    /// Build a checker from a term list and the rejection reason to report.
    pub fn new<I, S>(terms: I, reason: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let terms = terms
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self {
            terms,
            reason: reason.into(),
        }
    }

    /// Whether no terms are configured.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    fn matched_term(&self, text: &str) -> Option<&str> {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|w| !w.is_empty())
            .collect();

        self.terms
            .iter()
            .find(|term| {
                if term.contains(char::is_whitespace) {
                    lowered.contains(term.as_str())
                } else {
                    words.contains(&term.as_str())
                }
            })
            .map(String::as_str)
    }
}

#[async_trait]
impl SafetyChecker for KeywordSafetyChecker {
    fn name(&self) -> &str {
        "keywords"
    }

    async fn check(&self, text: &str) -> Result<SafetyVerdict, SafetyCheckError> {
        Ok(match self.matched_term(text) {
            Some(term) => {
                tracing::debug!(term, "blocked term matched");
                SafetyVerdict::unsafe_because(&self.reason)
            }
            None => SafetyVerdict::safe(),
        })
    }
}
