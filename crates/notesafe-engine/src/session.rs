//! Backup sessions
//!
//! A [`BackupSession`] owns the verified copies of every image a note embeds
//! for the duration of one mutation. It moves through a small state machine:
//!
//! ```text
//! Created ──► BackedUp ──► Processing ──► Committed
//!    │            │             │
//!    └────────────┴─────────────┴──────► RolledBack
//! ```
//!
//! Terminal states are final. A rollback that cannot restore every image
//! leaves the state unchanged so it can be retried.

use crate::error::{EngineError, EngineResult, RestoreFailure, RollbackFailure};
use crate::manifest::{write_atomic, ManifestEntry, SessionManifest, SessionOwner};
use crate::resolve::VaultLayout;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use notesafe_integrity::{verify_files, ContentHash, ImageReference, IntegrityIssue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Globally unique session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Borrow as a string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a [`BackupSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered; nothing copied yet
    Created,
    /// Every image has a verified backup
    BackedUp,
    /// Mutation callback is running
    Processing,
    /// Changes kept (terminal)
    Committed,
    /// Images restored (terminal)
    RolledBack,
}

impl SessionState {
    /// Whether no further transition is possible
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// Whether live images may differ from their backups
    #[inline]
    #[must_use]
    pub const fn has_backups(self) -> bool {
        matches!(self, Self::BackedUp | Self::Processing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::BackedUp => "backed_up",
            Self::Processing => "processing",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        })
    }
}

/// Outcome of [`BackupSession::validate_backup_integrity`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupValidation {
    /// True when every backup still matches the checksum taken at backup time
    pub all_backups_valid: bool,
    /// Backups that diverged or disappeared
    pub issues: Vec<IntegrityIssue>,
    /// Backups checked
    pub checked: usize,
}

/// What a successful rollback did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackSummary {
    /// Images rewritten from their backup
    pub restored: usize,
    /// Images that already matched their backup
    pub already_intact: usize,
}

/// Verified backups for one note mutation
#[derive(Debug)]
pub struct BackupSession {
    id: SessionId,
    operation_name: String,
    note_path: PathBuf,
    images: Vec<ImageReference>,
    /// original path -> backup path, in backup order
    backup_locations: IndexMap<PathBuf, PathBuf>,
    state: SessionState,
    created_at: DateTime<Utc>,
    session_dir: PathBuf,
    retain_after_commit: bool,
    layout: Arc<VaultLayout>,
    owner: Option<SessionOwner>,
}

impl BackupSession {
    /// New session in [`SessionState::Created`]
    #[must_use]
    pub fn new(
        id: SessionId,
        operation_name: impl Into<String>,
        note_path: impl Into<PathBuf>,
        layout: Arc<VaultLayout>,
        retain_after_commit: bool,
    ) -> Self {
        let session_dir = layout.backup_root().join(id.as_str());
        Self {
            id,
            operation_name: operation_name.into(),
            note_path: note_path.into(),
            images: Vec::new(),
            backup_locations: IndexMap::new(),
            state: SessionState::Created,
            created_at: Utc::now(),
            session_dir,
            retain_after_commit,
            layout,
            owner: None,
        }
    }

    /// Record `owner` in every manifest this session writes
    #[must_use]
    pub fn with_owner(mut self, owner: Option<SessionOwner>) -> Self {
        self.owner = owner;
        self
    }

    /// Rebuild a session from a manifest left on disk
    ///
    /// Used by crash recovery; the session resumes in the recorded state.
    #[must_use]
    pub fn from_manifest(
        manifest: SessionManifest,
        session_dir: PathBuf,
        layout: Arc<VaultLayout>,
        retain_after_commit: bool,
    ) -> Self {
        let mut images = Vec::with_capacity(manifest.entries.len());
        let mut backup_locations = IndexMap::with_capacity(manifest.entries.len());
        for entry in manifest.entries {
            images.push(ImageReference::new(entry.original.clone(), entry.checksum));
            backup_locations.insert(entry.original, entry.backup);
        }
        Self {
            id: manifest.session_id,
            operation_name: manifest.operation_name,
            note_path: manifest.note_path,
            images,
            backup_locations,
            state: manifest.state,
            created_at: manifest.created_at,
            session_dir,
            retain_after_commit,
            layout,
            owner: manifest.owner,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    #[must_use]
    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    #[inline]
    #[must_use]
    pub fn note_path(&self) -> &Path {
        &self.note_path
    }

    #[inline]
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Images under protection, with the checksum taken at backup time once
    /// backed up
    #[inline]
    #[must_use]
    pub fn images(&self) -> &[ImageReference] {
        &self.images
    }

    /// Original path to backup path
    #[inline]
    #[must_use]
    pub fn backup_locations(&self) -> &IndexMap<PathBuf, PathBuf> {
        &self.backup_locations
    }

    /// Directory holding this session's backups and manifest
    #[inline]
    #[must_use]
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    fn transition(&mut self, to: SessionState) -> EngineResult<()> {
        use SessionState::{BackedUp, Committed, Created, Processing, RolledBack};
        let allowed = matches!(
            (self.state, to),
            (Created, BackedUp)
                | (BackedUp, Processing)
                | (BackedUp | Processing, Committed)
                | (Created | BackedUp | Processing, RolledBack)
        );
        if !allowed {
            return Err(EngineError::InvalidTransition {
                session_id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        debug!(session = %self.id, from = %self.state, to = %to, "session transition");
        self.state = to;
        Ok(())
    }

    /// Set the images to protect
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] unless the session is still
    /// [`SessionState::Created`].
    pub fn track_images(&mut self, images: impl IntoIterator<Item = ImageReference>) -> EngineResult<()> {
        if self.state != SessionState::Created {
            return Err(EngineError::Validation(format!(
                "session {} is {}; images can only be tracked before backup",
                self.id, self.state
            )));
        }
        let mut unique: IndexMap<PathBuf, ImageReference> = IndexMap::new();
        for image in images {
            unique.entry(image.path.clone()).or_insert(image);
        }
        self.images = unique.into_values().collect();
        Ok(())
    }

    /// Copy every tracked image into the session directory and verify it
    ///
    /// On failure the partial backup directory is removed and the session
    /// stays [`SessionState::Created`]. A session with no images moves to
    /// [`SessionState::BackedUp`] without touching the disk.
    ///
    /// # Errors
    /// [`EngineError::NotFound`] or [`EngineError::PermissionDenied`] for an
    /// unreadable source, [`EngineError::Integrity`] if a copy does not verify,
    /// and [`EngineError::Io`] for anything else.
    pub fn create_backups(&mut self) -> EngineResult<()> {
        if self.state != SessionState::Created {
            return Err(EngineError::InvalidTransition {
                session_id: self.id.clone(),
                from: self.state,
                to: SessionState::BackedUp,
            });
        }
        if self.images.is_empty() {
            return self.transition(SessionState::BackedUp);
        }

        match self.copy_all() {
            Ok(()) => {
                self.transition(SessionState::BackedUp)?;
                if let Err(err) = self.write_manifest() {
                    self.state = SessionState::Created;
                    self.discard_backups();
                    return Err(err);
                }
                info!(session = %self.id, images = self.images.len(), "backups created");
                Ok(())
            }
            Err(err) => {
                warn!(session = %self.id, error = %err, "backup failed; discarding partial copies");
                self.discard_backups();
                Err(err)
            }
        }
    }

    fn copy_all(&mut self) -> EngineResult<()> {
        fs::create_dir_all(&self.session_dir).map_err(|e| EngineError::io(&self.session_dir, e))?;

        for image in &mut self.images {
            let bytes = fs::read(&image.path).map_err(|e| EngineError::io(&image.path, e))?;
            let checksum = ContentHash::compute(&bytes);
            if checksum != image.checksum {
                debug!(file = %image.path.display(), "image changed since scan; using current content");
                image.checksum = checksum;
            }

            let backup = self
                .session_dir
                .join(self.layout.backup_relative_path(&image.path));
            write_atomic(&backup, &bytes).map_err(|e| EngineError::io(&backup, e))?;

            let issues = verify_files([(backup.as_path(), checksum)]);
            if !issues.is_empty() {
                return Err(EngineError::Integrity { issues });
            }
            self.backup_locations.insert(image.path.clone(), backup);
        }
        Ok(())
    }

    fn discard_backups(&mut self) {
        self.backup_locations.clear();
        if let Err(err) = remove_dir_if_exists(&self.session_dir) {
            warn!(session = %self.id, error = %err, "cannot remove backup directory");
        }
    }

    fn manifest(&self) -> SessionManifest {
        SessionManifest {
            session_id: self.id.clone(),
            operation_name: self.operation_name.clone(),
            note_path: self.note_path.clone(),
            state: self.state,
            created_at: self.created_at,
            owner: self.owner.clone(),
            entries: self
                .images
                .iter()
                .filter_map(|image| {
                    self.backup_locations.get(&image.path).map(|backup| ManifestEntry {
                        original: image.path.clone(),
                        backup: backup.clone(),
                        checksum: image.checksum,
                    })
                })
                .collect(),
        }
    }

    fn write_manifest(&self) -> EngineResult<()> {
        if self.backup_locations.is_empty() {
            return Ok(());
        }
        self.manifest().write(&self.session_dir)
    }

    /// Mark the start of the mutation callback
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidTransition`] unless backed up.
    pub fn begin_processing(&mut self) -> EngineResult<()> {
        self.transition(SessionState::Processing)?;
        if let Err(err) = self.write_manifest() {
            warn!(session = %self.id, error = %err, "cannot record processing state in manifest");
        }
        Ok(())
    }

    /// Re-verify every backup copy against the checksum taken at backup time
    #[must_use]
    pub fn validate_backup_integrity(&self) -> BackupValidation {
        let issues = verify_files(self.images.iter().filter_map(|image| {
            self.backup_locations
                .get(&image.path)
                .map(|backup| (backup.as_path(), image.checksum))
        }));
        BackupValidation {
            all_backups_valid: issues.is_empty(),
            checked: self.backup_locations.len(),
            issues,
        }
    }

    /// Restore every image from its backup
    ///
    /// Idempotent: a rolled-back session returns immediately, and images that
    /// already match their backup are left alone. Rolling back a committed
    /// session does nothing. After a verified restore the backup directory is
    /// removed.
    ///
    /// # Errors
    /// Returns [`RollbackFailure`] listing every image that could not be
    /// restored; the session state is left unchanged so the call can be
    /// retried.
    pub fn rollback(&mut self) -> Result<RollbackSummary, RollbackFailure> {
        match self.state {
            SessionState::RolledBack => return Ok(RollbackSummary::default()),
            SessionState::Committed => {
                warn!(session = %self.id, "rollback requested for committed session; ignoring");
                return Ok(RollbackSummary::default());
            }
            SessionState::Created => {
                self.state = SessionState::RolledBack;
                debug!(session = %self.id, "empty rollback");
                return Ok(RollbackSummary::default());
            }
            SessionState::BackedUp | SessionState::Processing => {}
        }

        let mut summary = RollbackSummary::default();
        let mut failures = Vec::new();
        for image in &self.images {
            let Some(backup) = self.backup_locations.get(&image.path) else {
                continue;
            };
            match restore_one(&image.path, backup, image.checksum) {
                Ok(true) => summary.restored += 1,
                Ok(false) => summary.already_intact += 1,
                Err(reason) => failures.push(RestoreFailure {
                    original: image.path.clone(),
                    backup: backup.clone(),
                    reason,
                }),
            }
        }

        if !failures.is_empty() {
            return Err(RollbackFailure {
                session_id: self.id.clone(),
                note_path: self.note_path.clone(),
                failures,
            });
        }

        self.state = SessionState::RolledBack;
        if let Err(err) = remove_dir_if_exists(&self.session_dir) {
            warn!(session = %self.id, error = %err, "restored, but cannot remove backup directory");
        }
        info!(
            session = %self.id,
            restored = summary.restored,
            intact = summary.already_intact,
            "session rolled back"
        );
        Ok(summary)
    }

    /// Keep the mutation's changes
    ///
    /// Never touches live images. Backups are either kept with a `committed`
    /// manifest or removed, depending on the retention setting.
    ///
    /// # Errors
    /// [`EngineError::InvalidTransition`] unless backed up or processing, or
    /// an IO error if the manifest cannot be updated. The state is unchanged
    /// on error.
    pub fn commit(&mut self) -> EngineResult<()> {
        if !self.state.has_backups() {
            return Err(EngineError::InvalidTransition {
                session_id: self.id.clone(),
                from: self.state,
                to: SessionState::Committed,
            });
        }

        if !self.backup_locations.is_empty() {
            if self.retain_after_commit {
                let mut manifest = self.manifest();
                manifest.state = SessionState::Committed;
                manifest.write(&self.session_dir)?;
            } else {
                let manifest_path = SessionManifest::path_in(&self.session_dir);
                match fs::remove_file(&manifest_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(EngineError::io(manifest_path, e)),
                }
                if let Err(err) = remove_dir_if_exists(&self.session_dir) {
                    warn!(session = %self.id, error = %err, "committed, but cannot remove backup directory");
                }
            }
        }

        self.transition(SessionState::Committed)?;
        info!(session = %self.id, retained = self.retain_after_commit, "session committed");
        Ok(())
    }
}

/// Restore `original` from `backup` unless it already has `expected` content
///
/// Returns whether a copy was made.
fn restore_one(original: &Path, backup: &Path, expected: ContentHash) -> Result<bool, String> {
    if ContentHash::compute_file(original).is_ok_and(|actual| actual == expected) {
        return Ok(false);
    }

    let bytes = fs::read(backup).map_err(|e| format!("cannot read backup: {e}"))?;
    if ContentHash::compute(&bytes) != expected {
        return Err("backup copy is corrupted".to_string());
    }
    write_atomic(original, &bytes).map_err(|e| format!("cannot write image: {e}"))?;

    match ContentHash::compute_file(original) {
        Ok(actual) if actual == expected => Ok(true),
        Ok(actual) => Err(format!("restored file has checksum {}", actual.short())),
        Err(e) => Err(format!("cannot verify restored file: {e}")),
    }
}

fn remove_dir_if_exists(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
