//! Error classification
//!
//! Maps engine errors onto a small set of actionable kinds, each with a
//! user-facing message, remediation steps, and the log severity the processor
//! should use. Classification never influences whether a rollback happens.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Actionable error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Note or image missing
    NotFound,
    /// Filesystem access denied
    PermissionDenied,
    /// Checksums diverged
    IntegrityMismatch,
    /// Callback exceeded its budget
    Timeout,
    /// Note locked by another session
    Concurrency,
    /// Bad input
    Validation,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    /// Stable snake_case name, as used in serialized results
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::IntegrityMismatch => "integrity_mismatch",
            Self::Timeout => "timeout",
            Self::Concurrency => "concurrency",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log severity chosen for a classified error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Expected contention; nothing to fix
    Info,
    /// Recoverable; the user may want to act
    Warning,
    /// Needs attention
    Error,
}

/// Result of classifying one error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    /// Category
    pub kind: ErrorKind,
    /// Short user-facing message
    pub message: String,
    /// Suggested remediation steps, most useful first
    pub suggestions: Vec<String>,
    /// Log severity
    pub severity: Severity,
}

/// Stateless classifier for [`EngineError`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Create a classifier
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Category only
    #[must_use]
    pub fn kind_of(&self, error: &EngineError) -> ErrorKind {
        match error {
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            EngineError::Integrity { .. } => ErrorKind::IntegrityMismatch,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::Concurrency { .. } => ErrorKind::Concurrency,
            EngineError::Validation(_) | EngineError::Config(_) => ErrorKind::Validation,
            EngineError::InvalidTransition { .. }
            | EngineError::Io { .. }
            | EngineError::Mutation(_)
            | EngineError::Panicked(_) => ErrorKind::Unknown,
        }
    }

    /// Full classification with message and remediation
    #[must_use]
    pub fn classify(&self, error: &EngineError) -> ErrorClassification {
        let kind = self.kind_of(error);
        let (message, suggestions, severity): (&str, &[&str], Severity) = match kind {
            ErrorKind::NotFound => (
                "A note or embedded image could not be found",
                &[
                    "Check that the note path is correct and inside the vault",
                    "Fix or remove broken image embeds in the note",
                    "Set missing_image_policy = \"skip\" to process notes with broken embeds",
                ],
                Severity::Warning,
            ),
            ErrorKind::PermissionDenied => (
                "The filesystem denied access to a vault file",
                &[
                    "Check file and directory permissions in the vault",
                    "Make sure the backup directory is writable",
                    "Close applications holding exclusive locks on the files",
                ],
                Severity::Error,
            ),
            ErrorKind::IntegrityMismatch => (
                "Image content changed unexpectedly; the note was rolled back",
                &[
                    "Check for other programs writing to the vault during processing",
                    "Run an integrity report to list affected images",
                    "Retry the operation once the vault is idle",
                ],
                Severity::Error,
            ),
            ErrorKind::Timeout => (
                "The operation took too long and was rolled back",
                &[
                    "Retry the operation",
                    "Raise processing_timeout_ms for slow external services",
                ],
                Severity::Warning,
            ),
            ErrorKind::Concurrency => (
                "Another operation is already processing this note or one of its images",
                &[
                    "Retry after the other operation finishes",
                    "Use lock_policy mode \"wait\" to queue instead of failing",
                ],
                Severity::Info,
            ),
            ErrorKind::Validation => (
                "The request was invalid",
                &["Check the note path and engine configuration"],
                Severity::Warning,
            ),
            ErrorKind::Unknown => (
                "The operation failed; all images were restored",
                &[
                    "Inspect the error message for details",
                    "Retry the operation",
                ],
                Severity::Error,
            ),
        };

        ErrorClassification {
            kind,
            message: message.to_string(),
            suggestions: suggestions.iter().map(|s| (*s).to_string()).collect(),
            severity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn kinds_cover_taxonomy() {
        let c = ErrorClassifier::new();
        assert_eq!(
            c.kind_of(&EngineError::NotFound {
                path: PathBuf::from("a.png")
            }),
            ErrorKind::NotFound
        );
        assert_eq!(
            c.kind_of(&EngineError::Integrity { issues: vec![] }),
            ErrorKind::IntegrityMismatch
        );
        assert_eq!(
            c.kind_of(&EngineError::Timeout {
                budget: Duration::from_secs(1)
            }),
            ErrorKind::Timeout
        );
        assert_eq!(c.kind_of(&EngineError::Mutation("x".into())), ErrorKind::Unknown);
        assert_eq!(c.kind_of(&EngineError::Validation("x".into())), ErrorKind::Validation);
    }

    #[test]
    fn every_classification_has_suggestions() {
        let c = ErrorClassifier::new();
        let errors = [
            EngineError::PermissionDenied {
                path: PathBuf::from("a"),
            },
            EngineError::Panicked("boom".into()),
            EngineError::Validation("empty".into()),
        ];
        for err in &errors {
            let classification = c.classify(err);
            assert!(!classification.suggestions.is_empty());
            assert!(!classification.message.is_empty());
        }
    }

    #[test]
    fn contention_is_informational() {
        let c = ErrorClassifier::new();
        let err = EngineError::Concurrency {
            path: PathBuf::from("n.md"),
            holder: "other-1".into(),
        };
        assert_eq!(c.classify(&err).severity, Severity::Info);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::IntegrityMismatch).unwrap();
        assert_eq!(json, "\"integrity_mismatch\"");
        assert_eq!(ErrorKind::PermissionDenied.to_string(), "permission_denied");
    }
}
