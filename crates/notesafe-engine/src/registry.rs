//! Session registry and per-note locks
//!
//! The registry hands out [`SessionGuard`]s. A guard owns its
//! [`BackupSession`] and exclusive locks on the session's note and on every
//! image it tracks; dropping it rolls back anything not yet committed and
//! releases the locks, whether the caller returned normally, bailed out early,
//! or unwound from a panic.
//!
//! Image locks keep two sessions from protecting the same file at once, so one
//! session's rollback can never overwrite bytes another session committed.

use crate::config::LockPolicy;
use crate::error::{EngineError, EngineResult};
use crate::manifest::SessionOwner;
use crate::resolve::VaultLayout;
use crate::session::{BackupSession, SessionId, SessionState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use notesafe_integrity::ImageReference;
use tracing::{debug, error, warn};

/// Longest operation-name prefix kept in a session id
const MAX_ID_PREFIX: usize = 40;

/// Bookkeeping for one live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub operation_name: String,
    pub note_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Live sessions and the note locks they hold
#[derive(Debug)]
pub struct SessionRegistry {
    layout: Arc<VaultLayout>,
    retain_after_commit: bool,
    lock_policy: LockPolicy,
    owner: Option<SessionOwner>,
    sessions: DashMap<SessionId, SessionInfo>,
    /// Note or image path -> holding session
    locks: Mutex<HashMap<PathBuf, SessionId>>,
    released: Condvar,
    sequence: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(layout: Arc<VaultLayout>, retain_after_commit: bool, lock_policy: LockPolicy) -> Self {
        Self {
            layout,
            retain_after_commit,
            lock_policy,
            owner: None,
            sessions: DashMap::new(),
            locks: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Stamp `owner` on the manifests of sessions created here
    #[must_use]
    pub fn with_owner(mut self, owner: SessionOwner) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Start a session for `note_path` and take its lock
    ///
    /// `note_path` is used as the lock key as given; callers pass the
    /// canonical path.
    ///
    /// # Errors
    /// Returns [`EngineError::Concurrency`] if another session holds the note
    /// and the lock policy gives up.
    pub fn create_backup_session(
        &self,
        operation_name: &str,
        note_path: &Path,
    ) -> EngineResult<SessionGuard<'_>> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let id = SessionId::from(format!(
            "{}-{seq}-{}",
            sanitize_operation(operation_name),
            ulid::Ulid::new()
        ));

        self.acquire_locks(&[note_path.to_path_buf()], &id)?;
        let session = BackupSession::new(
            id,
            operation_name,
            note_path,
            Arc::clone(&self.layout),
            self.retain_after_commit,
        )
        .with_owner(self.owner.clone());
        Ok(self.register(session))
    }

    /// Take over a session rebuilt outside the registry (crash recovery)
    ///
    /// # Errors
    /// Returns [`EngineError::Concurrency`] if the session's note or one of
    /// its images is locked.
    pub fn adopt_session(&self, session: BackupSession) -> EngineResult<SessionGuard<'_>> {
        let mut paths = vec![session.note_path().to_path_buf()];
        paths.extend(session.images().iter().map(|image| image.path.clone()));
        self.acquire_locks(&paths, session.id())?;
        Ok(self.register(session))
    }

    fn register(&self, session: BackupSession) -> SessionGuard<'_> {
        self.sessions.insert(
            session.id().clone(),
            SessionInfo {
                session_id: session.id().clone(),
                operation_name: session.operation_name().to_string(),
                note_path: session.note_path().to_path_buf(),
                created_at: session.created_at(),
            },
        );
        debug!(session = %session.id(), note = %session.note_path().display(), "session registered");
        SessionGuard {
            registry: self,
            session,
        }
    }

    /// Take every path for `id`, all or nothing
    fn acquire_locks(&self, paths: &[PathBuf], id: &SessionId) -> EngineResult<()> {
        let mut locks = self.locks.lock();
        if let LockPolicy::Wait { timeout_ms } = self.lock_policy {
            let deadline = Instant::now() + Duration::from_millis(timeout_ms);
            while first_conflict(&locks, paths, id).is_some() {
                if self.released.wait_until(&mut locks, deadline).timed_out() {
                    break;
                }
            }
        }
        if let Some((path, holder)) = first_conflict(&locks, paths, id) {
            return Err(EngineError::Concurrency { path, holder });
        }
        for path in paths {
            locks.insert(path.clone(), id.clone());
        }
        Ok(())
    }

    /// Forget a session and release its lock
    ///
    /// Returns whether the session was registered. Releasing twice is harmless.
    pub fn release(&self, session_id: &SessionId) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, holder| holder != session_id);
        let freed = locks.len() != before;
        drop(locks);
        if freed {
            self.released.notify_all();
        }
        removed
    }

    /// Whether any session holds `path` (a note or an image)
    #[must_use]
    pub fn is_locked(&self, path: &Path) -> bool {
        self.locks.lock().contains_key(path)
    }

    /// Session currently holding `path`
    #[must_use]
    pub fn holder(&self, path: &Path) -> Option<SessionId> {
        self.locks.lock().get(path).cloned()
    }

    #[must_use]
    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Live sessions, oldest first
    #[must_use]
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.iter().map(|e| e.value().clone()).collect();
        infos.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        infos
    }
}

fn first_conflict(
    locks: &HashMap<PathBuf, SessionId>,
    paths: &[PathBuf],
    id: &SessionId,
) -> Option<(PathBuf, SessionId)> {
    paths.iter().find_map(|path| {
        locks
            .get(path)
            .filter(|holder| *holder != id)
            .map(|holder| (path.clone(), holder.clone()))
    })
}

/// Lowercase the operation name and keep only id-safe characters
fn sanitize_operation(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(MAX_ID_PREFIX)
        .collect();
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "session".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Scoped ownership of a registered [`BackupSession`]
///
/// Dereferences to the session. On drop, a session that is not in a terminal
/// state is rolled back and the registry entry and lock are released.
#[derive(Debug)]
pub struct SessionGuard<'a> {
    registry: &'a SessionRegistry,
    session: BackupSession,
}

impl SessionGuard<'_> {
    /// Lock every image path, then track the images on the session
    ///
    /// Shadows [`BackupSession::track_images`] so that images are never
    /// protected without their locks.
    ///
    /// # Errors
    /// [`EngineError::Concurrency`] if another session holds one of the
    /// images and the lock policy gives up; otherwise as
    /// [`BackupSession::track_images`].
    pub fn track_images(&mut self, images: impl IntoIterator<Item = ImageReference>) -> EngineResult<()> {
        let images: Vec<ImageReference> = images.into_iter().collect();
        if self.session.state() == SessionState::Created {
            let paths: Vec<PathBuf> = images.iter().map(|image| image.path.clone()).collect();
            self.registry.acquire_locks(&paths, self.session.id())?;
        }
        self.session.track_images(images)
    }
}

impl Deref for SessionGuard<'_> {
    type Target = BackupSession;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl DerefMut for SessionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.session
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if !self.session.state().is_terminal() {
            match self.session.rollback() {
                Ok(summary) => warn!(
                    session = %self.session.id(),
                    restored = summary.restored,
                    "session dropped before completion; rolled back"
                ),
                Err(failure) => error!(
                    session = %failure.session_id,
                    note = %failure.note_path.display(),
                    failures = failure.failures.len(),
                    "{failure}"
                ),
            }
        }
        self.registry.release(self.session.id());
    }
}
