//! Provider error classification
//!
//! CloudStack reports "not found", "duplicate" and similar conditions only as
//! free-text messages. [`classify`] maps such a message onto a closed set of
//! classes by substring match against a phrase table.
//!
//! Each phrase carries its own case rule. Some phrases match
//! case-insensitively and others exactly, and the mix is intentional.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a provider error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The lookup matched nothing
    NotFound,
    /// A create was rejected because the resource already exists
    AlreadyExists,
    /// More than one match where exactly one was required
    Ambiguous,
    /// Timeouts and connection failures
    Transient,
    /// Anything unrecognised. Treated as terminal.
    Other,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::NotFound => write!(f, "not-found"),
            ErrorClass::AlreadyExists => write!(f, "already-exists"),
            ErrorClass::Ambiguous => write!(f, "ambiguous"),
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaseRule {
    Exact,
    Insensitive,
}

struct Phrase {
    text: &'static str,
    rule: CaseRule,
    class: ErrorClass,
}

const fn phrase(text: &'static str, rule: CaseRule, class: ErrorClass) -> Phrase {
    Phrase { text, rule, class }
}

/// Checked in order; first match wins.
/// Lowercase text is required for `Insensitive` entries.
const PHRASES: &[Phrase] = &[
    phrase("no match found", CaseRule::Insensitive, ErrorClass::NotFound),
    phrase("no load balancer rule found", CaseRule::Insensitive, ErrorClass::NotFound),
    phrase("Unable to find", CaseRule::Exact, ErrorClass::NotFound),
    phrase("does not exist", CaseRule::Exact, ErrorClass::NotFound),
    phrase("there is already", CaseRule::Insensitive, ErrorClass::AlreadyExists),
    phrase("already exists", CaseRule::Exact, ErrorClass::AlreadyExists),
    phrase("Found more than one", CaseRule::Exact, ErrorClass::Ambiguous),
    phrase("timed out", CaseRule::Insensitive, ErrorClass::Transient),
    phrase("timeout", CaseRule::Insensitive, ErrorClass::Transient),
    phrase("connection refused", CaseRule::Insensitive, ErrorClass::Transient),
    phrase("connection reset", CaseRule::Insensitive, ErrorClass::Transient),
    phrase("Service Unavailable", CaseRule::Exact, ErrorClass::Transient),
    phrase("502 Bad Gateway", CaseRule::Exact, ErrorClass::Transient),
];

/// Classify a raw provider error message.
pub fn classify(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    PHRASES
        .iter()
        .find(|p| match p.rule {
            CaseRule::Exact => message.contains(p.text),
            CaseRule::Insensitive => lower.contains(p.text),
        })
        .map(|p| p.class)
        .unwrap_or(ErrorClass::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insensitive_phrases() {
        assert_eq!(classify("No match found for prod-net"), ErrorClass::NotFound);
        assert_eq!(classify("NO MATCH FOUND"), ErrorClass::NotFound);
        assert_eq!(
            classify("There is already a firewall rule specified"),
            ErrorClass::AlreadyExists
        );
        assert_eq!(classify("request Timed Out"), ErrorClass::Transient);
    }

    #[test]
    fn test_exact_phrases_respect_case() {
        assert_eq!(classify("Unable to find zone"), ErrorClass::NotFound);
        // exact phrases do not match other casings
        assert_eq!(classify("unable to find zone"), ErrorClass::Other);

        assert_eq!(
            classify("Found more than one result for net"),
            ErrorClass::Ambiguous
        );
        assert_eq!(classify("found more than one result"), ErrorClass::Other);
    }

    #[test]
    fn test_unknown_message_is_other() {
        assert_eq!(classify(""), ErrorClass::Other);
        assert_eq!(
            classify("Insufficient capacity to deploy"),
            ErrorClass::Other
        );
    }

    #[test]
    fn test_insensitive_table_entries_are_lowercase() {
        for p in PHRASES.iter().filter(|p| p.rule == CaseRule::Insensitive) {
            assert_eq!(p.text, p.text.to_lowercase(), "{}", p.text);
        }
    }
}
