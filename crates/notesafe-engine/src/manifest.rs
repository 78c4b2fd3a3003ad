//! On-disk session manifests
//!
//! Every session that backs up at least one image writes `manifest.json` into
//! its backup directory. After a crash, a manifest in a non-terminal state is
//! enough to restore the images it lists.
//!
//! Manifests also name their [`SessionOwner`], so recovery leaves sessions of
//! a still-running processor alone.

use crate::error::{EngineError, EngineResult};
use crate::session::{SessionId, SessionState};
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use notesafe_integrity::ContentHash;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Processor instances alive in this process
static LIVE_PROCESSORS: Lazy<DashSet<String>> = Lazy::new(DashSet::new);

/// File name of the manifest inside a session directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// One backed-up image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Live image path
    pub original: PathBuf,
    /// Backup copy
    pub backup: PathBuf,
    /// Checksum taken at backup time
    pub checksum: ContentHash,
}

/// Process and processor instance that wrote a manifest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionOwner {
    /// OS process id
    pub pid: u32,
    /// Processor instance within that process
    pub processor_id: String,
}

impl SessionOwner {
    /// Fresh owner for this process, live until [`SessionOwner::retire`]
    #[must_use]
    pub fn register() -> Self {
        let processor_id = ulid::Ulid::new().to_string();
        LIVE_PROCESSORS.insert(processor_id.clone());
        Self {
            pid: std::process::id(),
            processor_id,
        }
    }

    /// Mark this owner as gone
    pub fn retire(&self) {
        LIVE_PROCESSORS.remove(&self.processor_id);
    }

    /// Whether the owner may still be running
    ///
    /// Exact for owners in this process. For other processes only the pid is
    /// checked, and platforms without a liveness check always answer `true`.
    #[must_use]
    pub fn is_live(&self) -> bool {
        if self.pid == std::process::id() {
            LIVE_PROCESSORS.contains(&self.processor_id)
        } else {
            pid_alive(self.pid)
        }
    }
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// Serialized session record
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub session_id: SessionId,
    pub operation_name: String,
    pub note_path: PathBuf,
    /// State at the time of the last write
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    /// Writer of the manifest; absent for sessions created outside a processor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<SessionOwner>,
    /// Backed-up images, in backup order
    pub entries: Vec<ManifestEntry>,
}

impl SessionManifest {
    /// Manifest path for a session directory
    #[inline]
    #[must_use]
    pub fn path_in(session_dir: &Path) -> PathBuf {
        session_dir.join(MANIFEST_FILE)
    }

    /// Atomically write the manifest into `session_dir`
    ///
    /// # Errors
    /// Returns an IO-derived [`EngineError`] if the file cannot be written.
    pub fn write(&self, session_dir: &Path) -> EngineResult<()> {
        let path = Self::path_in(session_dir);
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| EngineError::io(&path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
        write_atomic(&path, &bytes).map_err(|e| EngineError::io(&path, e))
    }

    /// Read the manifest from `session_dir`
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] when there is no manifest and an IO
    /// error for unreadable or malformed files.
    pub fn read(session_dir: &Path) -> EngineResult<Self> {
        let path = Self::path_in(session_dir);
        let bytes = fs::read(&path).map_err(|e| EngineError::io(&path, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::io(&path, io::Error::new(io::ErrorKind::InvalidData, e)))
    }
}

/// Write `bytes` to `path` through a temp file in the same directory
///
/// Readers see either the old content or the new content, never a mix.
/// Parent directories are created as needed.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".notesafe-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> SessionManifest {
        SessionManifest {
            session_id: SessionId::from("retag-1-01J"),
            operation_name: "retag".into(),
            note_path: PathBuf::from("/vault/n.md"),
            state: SessionState::BackedUp,
            created_at: Utc::now(),
            owner: None,
            entries: vec![ManifestEntry {
                original: PathBuf::from("/vault/a.png"),
                backup: PathBuf::from("/vault/.backups/retag-1-01J/a.png"),
                checksum: ContentHash::compute(b"a"),
            }],
        }
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = sample();
        manifest.write(dir.path()).unwrap();

        let loaded = SessionManifest::read(dir.path()).unwrap();
        assert_eq!(loaded, manifest);

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(raw["state"], "backed_up");
        assert_eq!(raw["entries"][0]["checksum"], ContentHash::compute(b"a").to_string());
    }

    #[test]
    fn owner_is_optional_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        sample().write(dir.path()).unwrap();
        let raw = fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap();
        assert!(!raw.contains("owner"));

        let owned = SessionManifest {
            owner: Some(SessionOwner::register()),
            ..sample()
        };
        owned.write(dir.path()).unwrap();
        assert_eq!(SessionManifest::read(dir.path()).unwrap().owner, owned.owner);
    }

    #[test]
    fn owner_liveness_follows_retire() {
        let owner = SessionOwner::register();
        assert_eq!(owner.pid, std::process::id());
        assert!(owner.is_live());
        owner.retire();
        assert!(!owner.is_live());

        let stranger = SessionOwner {
            pid: std::process::id(),
            processor_id: "never-registered".into(),
        };
        assert!(!stranger.is_live());
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SessionManifest::read(dir.path()),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/deeper/file.bin");
        write_atomic(&target, b"one").unwrap();
        write_atomic(&target, b"two").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"two");
        let leftovers = fs::read_dir(target.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
