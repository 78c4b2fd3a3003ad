//! Error types for the processing engine
//!
//! [`EngineError`] covers everything that can go wrong while protecting a
//! note: bad input, missing or unreadable files, checksum mismatches,
//! timeouts, and lock contention. Those are always caught by the processor
//! and turned into a failed `ProcessingResult`.
//!
//! [`RollbackFailure`] is kept apart on purpose: it means an image could not
//! be restored and may be lost, so it is returned as a distinct `Err` instead
//! of being folded into a result.

use crate::config::ConfigError;
use crate::session::{SessionId, SessionState};
use notesafe_integrity::{HashError, IntegrityIssue};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Empty or otherwise unusable input
    #[error("validation failed: {0}")]
    Validation(String),

    /// Referenced note or image is missing
    #[error("not found: {}", .path.display())]
    NotFound { path: PathBuf },

    /// Filesystem refused access
    #[error("permission denied: {}", .path.display())]
    PermissionDenied { path: PathBuf },

    /// Checksum mismatch between backup time and verification time
    #[error("integrity check failed for {} file(s)", .issues.len())]
    Integrity { issues: Vec<IntegrityIssue> },

    /// Mutation callback exceeded its budget
    #[error("operation timed out after {}ms", .budget.as_millis())]
    Timeout { budget: Duration },

    /// Another session holds the lock on the note or one of its images
    #[error("{} is locked by session {holder}", .path.display())]
    Concurrency { path: PathBuf, holder: SessionId },

    /// Session asked to move to a state it cannot reach
    #[error("session {session_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        session_id: SessionId,
        from: SessionState,
        to: SessionState,
    },

    /// Any other IO failure
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Mutation callback reported failure or returned an error
    #[error("mutation failed: {0}")]
    Mutation(String),

    /// Mutation callback panicked
    #[error("mutation panicked: {0}")]
    Panicked(String),

    /// Engine configuration is invalid
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Classify an IO error on a path into the matching variant
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }

    /// Convert a checksum failure, keeping NotFound/PermissionDenied distinct
    #[must_use]
    pub fn from_hash(err: HashError, fallback_path: &Path) -> Self {
        match err {
            HashError::Io { path, source } => Self::io(path, source),
            other => Self::Io {
                path: fallback_path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
            },
        }
    }

    /// Translate an error returned by a mutation callback
    ///
    /// Engine errors and IO errors raised inside the callback keep their
    /// meaning; anything else becomes [`EngineError::Mutation`].
    #[must_use]
    pub fn from_callback(err: anyhow::Error, note_path: &Path) -> Self {
        let err = match err.downcast::<EngineError>() {
            Ok(engine) => return engine,
            Err(other) => other,
        };
        match err.downcast::<io::Error>() {
            Ok(io_err) => Self::io(note_path, io_err),
            Err(other) => Self::Mutation(format!("{other:#}")),
        }
    }

    /// Whether retrying the same operation later could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Concurrency { .. })
    }
}

/// One image that could not be restored during rollback
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RestoreFailure {
    /// Live image path
    pub original: PathBuf,
    /// Backup copy it should have been restored from
    pub backup: PathBuf,
    /// What went wrong
    pub reason: String,
}

/// Fatal: a rollback could not restore every image
///
/// The images listed in `failures` may no longer match their pre-operation
/// content. Backups for the session are left in place.
#[derive(Debug, Clone, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[error(
    "ROLLBACK FAILED for session {session_id} ({}): {} image(s) could not be restored",
    .note_path.display(),
    .failures.len()
)]
pub struct RollbackFailure {
    /// Session whose rollback failed
    pub session_id: SessionId,
    /// Note the session protected
    pub note_path: PathBuf,
    /// Images left unrestored
    pub failures: Vec<RestoreFailure>,
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
