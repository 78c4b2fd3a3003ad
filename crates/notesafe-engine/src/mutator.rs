//! Callback boundary for external note mutators
//!
//! Tagging, summarization, and OCR workflows plug in through [`NoteMutator`]
//! or [`WorkflowOperation`]. The engine treats them as black boxes that may
//! rewrite the note and/or its images, fail, return an error, or panic.

use serde_json::Value;
use std::path::Path;

/// Explicit outcome of a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Changes should be kept
    Success,
    /// Changes must be discarded; carries the reason
    Failure(String),
}

impl MutationOutcome {
    /// Failure with a reason
    #[inline]
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure(reason.into())
    }

    /// Whether this outcome commits
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Single-method interface for anything that mutates a note in place
///
/// Closures `Fn(&Path) -> anyhow::Result<MutationOutcome>` implement it.
pub trait NoteMutator: Send + Sync {
    /// Apply the mutation to the note at `note_path`
    ///
    /// # Errors
    /// Any error is treated like [`MutationOutcome::Failure`]: the session is
    /// rolled back and the error is reported on the result.
    fn apply(&self, note_path: &Path) -> anyhow::Result<MutationOutcome>;

    /// Name used in session ids and logs
    fn name(&self) -> &str {
        "mutation"
    }
}

impl<F> NoteMutator for F
where
    F: Fn(&Path) -> anyhow::Result<MutationOutcome> + Send + Sync,
{
    fn apply(&self, note_path: &Path) -> anyhow::Result<MutationOutcome> {
        self(note_path)
    }
}

/// Outcome of a workflow that also reports what it did
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    /// Keep changes; payload is recorded on the result
    Success(Value),
    /// Discard changes
    Failure {
        /// Why the workflow gave up
        reason: String,
        /// Partial details, if any
        payload: Option<Value>,
    },
}

/// Workflow callback returning a rich payload (tags, quality score, ...)
pub trait WorkflowOperation: Send + Sync {
    /// Run the workflow against the note at `note_path`
    ///
    /// # Errors
    /// Any error rolls the session back.
    fn run(&self, note_path: &Path) -> anyhow::Result<WorkflowOutcome>;

    /// Name used in session ids and logs
    fn name(&self) -> &str {
        "workflow"
    }
}

impl<F> WorkflowOperation for F
where
    F: Fn(&Path) -> anyhow::Result<WorkflowOutcome> + Send + Sync,
{
    fn run(&self, note_path: &Path) -> anyhow::Result<WorkflowOutcome> {
        self(note_path)
    }
}
