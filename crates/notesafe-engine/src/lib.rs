//! notesafe engine
//!
//! Transactional mutation of vault notes: every image a note embeds is backed
//! up and verified before a mutation callback runs, then either kept (commit)
//! or restored byte-for-byte (rollback). Errors, panics and timeouts in the
//! callback all end in a rollback.
//!
//! # Core Concepts
//!
//! - [`SafeProcessor`]: the entry point; one protected call per note
//! - [`BackupSession`]: verified copies plus a `Created → BackedUp →
//!   Processing → Committed | RolledBack` state machine
//! - [`SessionRegistry`]: live sessions and per-note locks, handed out as
//!   RAII [`SessionGuard`]s
//! - [`NoteMutator`] / [`WorkflowOperation`]: the callback boundary
//!
//! # Example
//!
//! ```rust,ignore
//! use notesafe_engine::prelude::*;
//! use std::sync::Arc;
//!
//! let processor = SafeProcessor::new(EngineConfig::new("/home/me/vault"))?;
//! let retag = Arc::new(|note: &Path| -> anyhow::Result<MutationOutcome> {
//!     let text = std::fs::read_to_string(note)?;
//!     std::fs::write(note, format!("{text}\n#reviewed\n"))?;
//!     Ok(MutationOutcome::Success)
//! });
//!
//! let result = processor.process_note_with_images("inbox/meeting.md", &retag)?;
//! assert!(result.success);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod classify;
pub mod config;
pub mod error;
pub mod manifest;
pub mod mutator;
pub mod perf;
pub mod processor;
pub mod registry;
pub mod resolve;
pub mod result;
pub mod session;
pub mod telemetry;

pub use classify::{ErrorClassification, ErrorClassifier, ErrorKind, Severity};
pub use config::{ConfigError, EngineConfig, LockPolicy, MissingImagePolicy};
pub use error::{EngineError, EngineResult, RestoreFailure, RollbackFailure};
pub use manifest::{ManifestEntry, SessionManifest, SessionOwner, MANIFEST_FILE};
pub use mutator::{MutationOutcome, NoteMutator, WorkflowOperation, WorkflowOutcome};
pub use perf::{PerformanceMetrics, PerformanceTracker, TimingStats};
pub use processor::{RecoveryReport, SafeProcessor};
pub use registry::{SessionGuard, SessionInfo, SessionRegistry};
pub use result::ProcessingResult;
pub use session::{BackupSession, BackupValidation, RollbackSummary, SessionId, SessionState};

pub use notesafe_integrity::{ContentHash, ImageReference, IntegrityIssue, IntegrityReport};

/// Common imports
pub mod prelude {
    pub use crate::{
        EngineConfig, EngineError, LockPolicy, MutationOutcome, NoteMutator, ProcessingResult,
        RollbackFailure, SafeProcessor, WorkflowOperation, WorkflowOutcome,
    };
    pub use std::path::Path;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
