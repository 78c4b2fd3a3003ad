//! Protected note processing
//!
//! [`SafeProcessor`] wraps a mutation callback in a backup session:
//!
//! 1. Resolve and read the note, scan it for image embeds
//! 2. Resolve and checksum every embedded image
//! 3. Open a session (takes the note lock) and back the images up
//! 4. Run the callback, catching errors, panics and timeouts
//! 5. Commit if the callback succeeded and the backups still verify,
//!    otherwise restore every image
//!
//! Only a rollback that cannot restore an image escapes as an `Err`; every
//! other failure is reported through [`ProcessingResult`].

use crate::classify::{ErrorClassifier, Severity};
use crate::config::{EngineConfig, MissingImagePolicy};
use crate::error::{EngineError, EngineResult, RollbackFailure};
use crate::manifest::{SessionManifest, SessionOwner};
use crate::mutator::{MutationOutcome, NoteMutator, WorkflowOperation, WorkflowOutcome};
use crate::perf::{PerformanceMetrics, PerformanceTracker};
use crate::registry::{SessionGuard, SessionRegistry};
use crate::resolve::VaultLayout;
use crate::result::ProcessingResult;
use crate::session::{BackupSession, SessionId, SessionState};
use crossbeam::channel::{self, RecvTimeoutError};
use indexmap::IndexMap;
use notesafe_integrity::{ImageReference, IntegrityMonitor, IntegrityReport};
use notesafe_scanner::ImageReferenceScanner;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn};

/// What the callback asked for
enum CallbackOutcome {
    Commit(Option<Value>),
    Abort {
        error: EngineError,
        payload: Option<Value>,
    },
}

impl CallbackOutcome {
    fn abort(error: EngineError) -> Self {
        Self::Abort {
            error,
            payload: None,
        }
    }
}

/// Sessions found on disk by [`SafeProcessor::recover_interrupted_sessions`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Session directories inspected
    pub scanned: usize,
    /// Interrupted sessions whose images were restored
    pub recovered: Vec<SessionId>,
    /// Committed sessions left in place
    pub committed: Vec<SessionId>,
    /// Sessions skipped because their owner may still be running or their
    /// note or images are locked
    pub skipped: Vec<SessionId>,
    /// Rollbacks that could not restore every image
    pub failed: Vec<RollbackFailure>,
    /// Directories whose manifest could not be read
    pub unreadable: Vec<PathBuf>,
}

impl RecoveryReport {
    /// Whether every interrupted session was restored
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.unreadable.is_empty()
    }
}

/// Transactional note processor
///
/// Cheap to share across threads: every call takes `&self`.
#[derive(Debug)]
pub struct SafeProcessor {
    config: EngineConfig,
    layout: Arc<VaultLayout>,
    scanner: ImageReferenceScanner,
    registry: SessionRegistry,
    monitor: IntegrityMonitor,
    tracker: PerformanceTracker,
    classifier: ErrorClassifier,
    /// Written into every manifest; retired on drop
    owner: SessionOwner,
    /// Dedicated pool for parallel batches when `parallelism > 0`
    pool: Option<rayon::ThreadPool>,
}

impl SafeProcessor {
    /// Create a processor for the vault named in `config`
    ///
    /// # Errors
    /// Returns [`EngineError::Config`] for an invalid configuration and an
    /// IO-derived error if the vault root cannot be resolved.
    pub fn new(mut config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        config.vault_root =
            fs::canonicalize(&config.vault_root).map_err(|e| EngineError::io(&config.vault_root, e))?;
        if !config.vault_root.is_dir() {
            return Err(EngineError::Validation(format!(
                "vault root {} is not a directory",
                config.vault_root.display()
            )));
        }

        let layout = Arc::new(VaultLayout::new(
            &config.vault_root,
            &config.backup_dir_name,
            &config.attachment_dirs,
        ));
        let pool = match config.parallelism {
            0 => None,
            threads => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("notesafe-worker-{i}"))
                    .build()
                    .map_err(|e| EngineError::Validation(format!("cannot build worker pool: {e}")))?,
            ),
        };

        let owner = SessionOwner::register();
        info!(vault = %config.vault_root.display(), processor = %owner.processor_id, "processor ready");
        Ok(Self {
            scanner: ImageReferenceScanner::with_extensions(&config.image_extensions),
            registry: SessionRegistry::new(
                Arc::clone(&layout),
                config.retain_backups_after_commit,
                config.lock_policy,
            )
            .with_owner(owner.clone()),
            monitor: IntegrityMonitor::new(),
            tracker: PerformanceTracker::new(),
            classifier: ErrorClassifier::new(),
            owner,
            layout,
            pool,
            config,
        })
    }

    /// Run `operation` against one note with every embedded image protected
    ///
    /// # Errors
    /// Returns [`RollbackFailure`] only when a rollback could not restore
    /// every image. All other failures produce `Ok` with `success == false`.
    pub fn process_note_with_images<M>(
        &self,
        note_path: impl AsRef<Path>,
        operation: &Arc<M>,
    ) -> Result<ProcessingResult, RollbackFailure>
    where
        M: NoteMutator + ?Sized + 'static,
    {
        let op = Arc::clone(operation);
        self.run_protected(note_path.as_ref(), operation.name(), move |path| {
            match op.apply(&path) {
                Ok(MutationOutcome::Success) => CallbackOutcome::Commit(None),
                Ok(MutationOutcome::Failure(reason)) => {
                    CallbackOutcome::abort(EngineError::Mutation(reason))
                }
                Err(err) => CallbackOutcome::abort(EngineError::from_callback(err, &path)),
            }
        })
    }

    /// Process notes one after another, each in its own session
    ///
    /// The output has the same length and order as `notes`; a failure on one
    /// note never stops the batch.
    pub fn process_notes_batch<P, M>(
        &self,
        notes: &[P],
        operation: &Arc<M>,
    ) -> Vec<Result<ProcessingResult, RollbackFailure>>
    where
        P: AsRef<Path>,
        M: NoteMutator + ?Sized + 'static,
    {
        let _span = info_span!("batch", notes = notes.len()).entered();
        let results: Vec<_> = notes
            .iter()
            .map(|note| self.process_note_with_images(note, operation))
            .collect();
        log_batch(&results);
        results
    }

    /// Same contract as [`SafeProcessor::process_notes_batch`], on a rayon pool
    pub fn process_notes_parallel<P, M>(
        &self,
        notes: &[P],
        operation: &Arc<M>,
    ) -> Vec<Result<ProcessingResult, RollbackFailure>>
    where
        P: AsRef<Path> + Sync,
        M: NoteMutator + ?Sized + 'static,
    {
        let run = || -> Vec<_> {
            notes
                .par_iter()
                .map(|note| self.process_note_with_images(note, operation))
                .collect()
        };
        let results = match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        };
        log_batch(&results);
        results
    }

    /// Run a workflow that reports a JSON payload
    ///
    /// Atomicity is identical to [`SafeProcessor::process_note_with_images`];
    /// the payload lands in [`ProcessingResult::workflow_payload`] whether the
    /// workflow succeeded or not.
    ///
    /// # Errors
    /// Returns [`RollbackFailure`] only when a rollback could not restore
    /// every image.
    pub fn safe_workflow_processing<W>(
        &self,
        note_path: impl AsRef<Path>,
        workflow: &Arc<W>,
    ) -> Result<ProcessingResult, RollbackFailure>
    where
        W: WorkflowOperation + ?Sized + 'static,
    {
        let wf = Arc::clone(workflow);
        self.run_protected(note_path.as_ref(), workflow.name(), move |path| {
            match wf.run(&path) {
                Ok(WorkflowOutcome::Success(payload)) => CallbackOutcome::Commit(Some(payload)),
                Ok(WorkflowOutcome::Failure { reason, payload }) => CallbackOutcome::Abort {
                    error: EngineError::Mutation(reason),
                    payload,
                },
                Err(err) => CallbackOutcome::abort(EngineError::from_callback(err, &path)),
            }
        })
    }

    fn run_protected<F>(
        &self,
        note_path: &Path,
        operation_name: &str,
        callback: F,
    ) -> Result<ProcessingResult, RollbackFailure>
    where
        F: FnOnce(PathBuf) -> CallbackOutcome + Send + 'static,
    {
        let started = Instant::now();
        let span = info_span!("process_note", note = %note_path.display(), operation = operation_name);
        let _enter = span.enter();

        let note = match self.resolve_note(note_path) {
            Ok(note) => note,
            Err(err) => {
                let shown = self.layout.root().join(note_path);
                return Ok(self.failure(shown, &err, None, Vec::new(), None, started));
            }
        };
        let images = match self.collect_images(&note) {
            Ok(images) => images,
            Err(err) => return Ok(self.failure(note, &err, None, Vec::new(), None, started)),
        };

        let mut session = match self.registry.create_backup_session(operation_name, &note) {
            Ok(session) => session,
            Err(err) => return Ok(self.failure(note, &err, None, images, None, started)),
        };
        debug!(session = %session.id(), images = images.len(), "session opened");

        if let Err(err) = session.track_images(images) {
            return self.abort(&mut session, err, None, started);
        }

        let backup_started = Instant::now();
        let backed_up = session.create_backups();
        self.tracker.record_backup(backup_started.elapsed());
        if let Err(err) = backed_up {
            return self.abort(&mut session, err, None, started);
        }
        self.monitor.begin_session(session.id().as_str(), session.images());

        let validation = session.validate_backup_integrity();
        if !validation.all_backups_valid {
            self.tracker.record_integrity_failure();
            let err = EngineError::Integrity {
                issues: validation.issues,
            };
            return self.abort(&mut session, err, None, started);
        }

        if let Err(err) = session.begin_processing() {
            return self.abort(&mut session, err, None, started);
        }

        let callback_started = Instant::now();
        let outcome = self.invoke(&note, callback);
        self.tracker.record_processing(callback_started.elapsed());

        match outcome {
            CallbackOutcome::Commit(payload) => {
                let validation = session.validate_backup_integrity();
                if !validation.all_backups_valid {
                    self.tracker.record_integrity_failure();
                    let err = EngineError::Integrity {
                        issues: validation.issues,
                    };
                    return self.abort(&mut session, err, payload, started);
                }
                if let Err(err) = session.commit() {
                    return self.abort(&mut session, err, payload, started);
                }
                self.monitor.end_session(session.id().as_str(), true);
                self.tracker.record_outcome(true);

                let result = ProcessingResult {
                    success: true,
                    note_path: note,
                    preserved_images: session.images().to_vec(),
                    processing_time: started.elapsed(),
                    backup_session_id: Some(session.id().clone()),
                    error_message: None,
                    error_type: None,
                    workflow_payload: payload,
                };
                info!(
                    session = %session.id(),
                    images = result.image_count(),
                    elapsed_ms = result.processing_time.as_millis(),
                    "note processed"
                );
                Ok(result)
            }
            CallbackOutcome::Abort { error, payload } => {
                self.abort(&mut session, error, payload, started)
            }
        }
    }

    /// Canonical path of an existing note inside the vault
    fn resolve_note(&self, note_path: &Path) -> EngineResult<PathBuf> {
        if note_path.as_os_str().is_empty() {
            return Err(EngineError::Validation("note path is empty".into()));
        }
        let joined = self.layout.root().join(note_path);
        let note = fs::canonicalize(&joined).map_err(|e| EngineError::io(&joined, e))?;
        if !note.is_file() {
            return Err(EngineError::Validation(format!(
                "{} is not a file",
                note.display()
            )));
        }
        if self.layout.is_backup_path(&note) {
            return Err(EngineError::Validation(format!(
                "{} is inside the backup store",
                note.display()
            )));
        }
        Ok(note)
    }

    /// Scan the note and checksum every embedded image, deduplicated by path
    fn collect_images(&self, note: &Path) -> EngineResult<Vec<ImageReference>> {
        let text = fs::read_to_string(note).map_err(|e| EngineError::io(note, e))?;
        let mut images: IndexMap<PathBuf, ImageReference> = IndexMap::new();

        for embed in self.scanner.scan(&text) {
            let path = self.layout.resolve(note, &embed);
            if images.contains_key(&path) {
                continue;
            }
            if self.layout.is_backup_path(&path) {
                warn!(embed = %embed.target, "embed points into the backup store; ignoring");
                continue;
            }
            match ImageReference::from_file(&path) {
                Ok(image) => {
                    images.insert(path, image);
                }
                Err(err)
                    if err.io_kind() == Some(io::ErrorKind::NotFound)
                        && self.config.missing_image_policy == MissingImagePolicy::Skip =>
                {
                    warn!(embed = %embed.target, file = %path.display(), "embedded image is missing; skipping");
                }
                Err(err) => return Err(EngineError::from_hash(err, &path)),
            }
        }
        Ok(images.into_values().collect())
    }

    /// Run the callback, catching panics and enforcing the timeout
    fn invoke<F>(&self, note: &Path, callback: F) -> CallbackOutcome
    where
        F: FnOnce(PathBuf) -> CallbackOutcome + Send + 'static,
    {
        let path = note.to_path_buf();
        let Some(budget) = self.config.processing_timeout() else {
            return catch_callback(callback, path);
        };

        let (tx, rx) = channel::bounded(1);
        let spawned = thread::Builder::new()
            .name("notesafe-callback".into())
            .spawn(move || {
                let _ = tx.send(catch_callback(callback, path));
            });
        if let Err(err) = spawned {
            return CallbackOutcome::abort(EngineError::io(note, err));
        }

        match rx.recv_timeout(budget) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                self.tracker.record_timeout();
                let grace = self.config.timeout_grace();
                if matches!(rx.recv_timeout(grace), Err(RecvTimeoutError::Timeout)) {
                    warn!(
                        budget_ms = budget.as_millis(),
                        grace_ms = grace.as_millis(),
                        "callback still running after grace period; later writes cannot be undone"
                    );
                }
                CallbackOutcome::abort(EngineError::Timeout { budget })
            }
            Err(RecvTimeoutError::Disconnected) => CallbackOutcome::abort(EngineError::Panicked(
                "callback thread exited without reporting".into(),
            )),
        }
    }

    /// Roll back and turn `error` into a failure result
    fn abort(
        &self,
        session: &mut SessionGuard<'_>,
        error: EngineError,
        payload: Option<Value>,
        started: Instant,
    ) -> Result<ProcessingResult, RollbackFailure> {
        let had_backups = session.state().has_backups();
        let rollback_started = Instant::now();
        let rolled_back = session.rollback();
        if had_backups {
            self.tracker.record_rollback(rollback_started.elapsed());
        }
        self.monitor.end_session(session.id().as_str(), false);

        match rolled_back {
            Ok(summary) => {
                debug!(
                    session = %session.id(),
                    restored = summary.restored,
                    intact = summary.already_intact,
                    "images restored"
                );
                Ok(self.failure(
                    session.note_path().to_path_buf(),
                    &error,
                    Some(session.id().clone()),
                    session.images().to_vec(),
                    payload,
                    started,
                ))
            }
            Err(failure) => {
                self.tracker.record_rollback_failure();
                self.tracker.record_outcome(false);
                error!(
                    session = %failure.session_id,
                    note = %failure.note_path.display(),
                    cause = %error,
                    "{failure}"
                );
                for restore in &failure.failures {
                    error!(
                        file = %restore.original.display(),
                        backup = %restore.backup.display(),
                        reason = %restore.reason,
                        "image not restored"
                    );
                }
                Err(failure)
            }
        }
    }

    fn failure(
        &self,
        note_path: PathBuf,
        error: &EngineError,
        session_id: Option<SessionId>,
        preserved_images: Vec<ImageReference>,
        workflow_payload: Option<Value>,
        started: Instant,
    ) -> ProcessingResult {
        let classification = self.classifier.classify(error);
        match classification.severity {
            Severity::Info => info!(kind = %classification.kind, error = %error, "note not processed"),
            Severity::Warning => warn!(kind = %classification.kind, error = %error, "note not processed"),
            Severity::Error => error!(kind = %classification.kind, error = %error, "note not processed"),
        }
        self.tracker.record_outcome(false);

        ProcessingResult {
            success: false,
            note_path,
            preserved_images,
            processing_time: started.elapsed(),
            backup_session_id: session_id,
            error_message: Some(error.to_string()),
            error_type: Some(classification.kind),
            workflow_payload,
        }
    }

    /// Restore images for sessions a crashed process left behind
    ///
    /// Every session directory whose manifest is still `backed_up` or
    /// `processing` is rolled back, unless the session is live in this
    /// processor or the manifest's [`SessionOwner`] may still be running.
    /// Committed sessions are left untouched.
    pub fn recover_interrupted_sessions(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let backup_root = self.layout.backup_root();
        let entries = match fs::read_dir(backup_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return report,
            Err(err) => {
                warn!(dir = %backup_root.display(), error = %err, "cannot scan backup store");
                report.unreadable.push(backup_root.to_path_buf());
                return report;
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .map(|e| e.path())
            .collect();
        dirs.sort();

        for dir in dirs {
            report.scanned += 1;
            let manifest = match SessionManifest::read(&dir) {
                Ok(manifest) => manifest,
                Err(EngineError::NotFound { .. }) => {
                    debug!(dir = %dir.display(), "no manifest; skipping");
                    continue;
                }
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "unreadable manifest");
                    report.unreadable.push(dir);
                    continue;
                }
            };

            let id = manifest.session_id.clone();
            if manifest.state == SessionState::Committed {
                report.committed.push(id);
                continue;
            }
            if !manifest.state.has_backups() || self.registry.is_active(&id) {
                report.skipped.push(id);
                continue;
            }
            if let Some(owner) = manifest.owner.as_ref().filter(|owner| owner.is_live()) {
                debug!(session = %id, pid = owner.pid, processor = %owner.processor_id, "owner still running; skipping");
                report.skipped.push(id);
                continue;
            }

            let session = BackupSession::from_manifest(
                manifest,
                dir,
                Arc::clone(&self.layout),
                self.config.retain_backups_after_commit,
            );
            let mut guard = match self.registry.adopt_session(session) {
                Ok(guard) => guard,
                Err(err) => {
                    warn!(session = %id, error = %err, "note or image is busy; recovery deferred");
                    report.skipped.push(id);
                    continue;
                }
            };
            let started = Instant::now();
            match guard.rollback() {
                Ok(summary) => {
                    self.tracker.record_rollback(started.elapsed());
                    info!(session = %id, restored = summary.restored, "interrupted session recovered");
                    report.recovered.push(id);
                }
                Err(failure) => {
                    self.tracker.record_rollback_failure();
                    error!(session = %id, "{failure}");
                    report.failed.push(failure);
                }
            }
        }
        report
    }

    /// Totals across every call made so far
    #[must_use]
    pub fn get_performance_metrics(&self) -> PerformanceMetrics {
        self.tracker.snapshot()
    }

    /// Re-verify every image this processor has protected
    #[must_use]
    pub fn integrity_report(&self) -> IntegrityReport {
        self.monitor.report()
    }

    /// Shared image baselines
    #[must_use]
    pub fn integrity_monitor(&self) -> &IntegrityMonitor {
        &self.monitor
    }

    /// Live sessions and note locks
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Configuration with the vault root canonicalized
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Vault path layout
    #[must_use]
    pub fn layout(&self) -> &VaultLayout {
        &self.layout
    }
}

impl Drop for SafeProcessor {
    fn drop(&mut self) {
        self.owner.retire();
    }
}

fn catch_callback<F>(callback: F, path: PathBuf) -> CallbackOutcome
where
    F: FnOnce(PathBuf) -> CallbackOutcome,
{
    panic::catch_unwind(AssertUnwindSafe(|| callback(path)))
        .unwrap_or_else(|payload| CallbackOutcome::abort(EngineError::Panicked(panic_message(&*payload))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn log_batch(results: &[Result<ProcessingResult, RollbackFailure>]) {
    let committed = results
        .iter()
        .filter(|r| r.as_ref().is_ok_and(|r| r.success))
        .count();
    let rollback_failures = results.iter().filter(|r| r.is_err()).count();
    if rollback_failures > 0 {
        error!(notes = results.len(), committed, rollback_failures, "batch finished with unrestored images");
    } else {
        info!(notes = results.len(), committed, "batch finished");
    }
}
