//! Integrity monitoring across processing sessions
//!
//! The [`IntegrityMonitor`] keeps a baseline checksum for every image that a
//! session has touched and can re-verify all of them on demand, producing an
//! [`IntegrityReport`] for external tooling.

use crate::hash::ContentHash;
use crate::reference::ImageReference;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A file whose content no longer matches its expected checksum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    /// Path of the divergent file
    pub file: PathBuf,
    /// Checksum recorded when the file was last known good
    pub expected_checksum: ContentHash,
    /// Checksum found now, `None` if the file is missing or unreadable
    pub actual_checksum: Option<ContentHash>,
}

impl IntegrityIssue {
    /// Whether the file has disappeared (or cannot be read at all)
    #[inline]
    #[must_use]
    pub fn is_missing(&self) -> bool {
        self.actual_checksum.is_none()
    }
}

/// Snapshot of the monitor's state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Number of images with a recorded baseline
    pub images_tracked: usize,
    /// Number of sessions that have registered images since creation
    pub monitoring_sessions: usize,
    /// Divergent files, sorted by path
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    /// True when no tracked file diverges from its baseline
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Compare each file against its expected checksum
///
/// Returns one issue per divergent file, in input order.
pub fn verify_files<'a, I>(expected: I) -> Vec<IntegrityIssue>
where
    I: IntoIterator<Item = (&'a Path, ContentHash)>,
{
    expected
        .into_iter()
        .filter_map(|(path, expected_checksum)| {
            let actual_checksum = ContentHash::compute_file(path).ok();
            (actual_checksum != Some(expected_checksum)).then(|| IntegrityIssue {
                file: path.to_path_buf(),
                expected_checksum,
                actual_checksum,
            })
        })
        .collect()
}

/// Thread-safe registry of image baselines
#[derive(Debug, Default)]
pub struct IntegrityMonitor {
    /// Image path -> last known-good checksum
    baselines: DashMap<PathBuf, ContentHash>,
    /// Session id -> images it registered, while the session is open
    open_sessions: DashMap<String, Vec<PathBuf>>,
    /// Sessions registered since creation
    sessions_seen: AtomicUsize,
}

impl IntegrityMonitor {
    /// Create an empty monitor
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) the baseline for one image
    pub fn track(&self, image: &ImageReference) {
        self.baselines.insert(image.path.clone(), image.checksum);
    }

    /// Stop tracking an image
    pub fn untrack(&self, path: &Path) -> Option<ContentHash> {
        self.baselines.remove(path).map(|(_, hash)| hash)
    }

    /// Baseline recorded for a path
    #[must_use]
    pub fn baseline(&self, path: &Path) -> Option<ContentHash> {
        self.baselines.get(path).map(|entry| *entry.value())
    }

    /// Register the images a session is about to protect
    pub fn begin_session(&self, session_id: &str, images: &[ImageReference]) {
        for image in images {
            self.track(image);
        }
        self.open_sessions.insert(
            session_id.to_string(),
            images.iter().map(|i| i.path.clone()).collect(),
        );
        self.sessions_seen.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(session = session_id, images = images.len(), "monitoring session");
    }

    /// Close a session
    ///
    /// When the session committed, baselines are refreshed from disk so later
    /// reports compare against the committed content. Otherwise the pre-session
    /// baselines stand.
    pub fn end_session(&self, session_id: &str, committed: bool) {
        let Some((_, paths)) = self.open_sessions.remove(session_id) else {
            return;
        };
        if !committed {
            return;
        }
        for path in paths {
            match ContentHash::compute_file(&path) {
                Ok(hash) => {
                    self.baselines.insert(path, hash);
                }
                Err(err) => {
                    tracing::warn!(file = %path.display(), error = %err, "cannot refresh baseline after commit");
                }
            }
        }
    }

    /// Verify one tracked image against its baseline
    ///
    /// Returns `None` when the image is untracked or intact.
    #[must_use]
    pub fn check(&self, path: &Path) -> Option<IntegrityIssue> {
        let expected = self.baseline(path)?;
        verify_files([(path, expected)]).pop()
    }

    /// Number of images with a baseline
    #[inline]
    #[must_use]
    pub fn images_tracked(&self) -> usize {
        self.baselines.len()
    }

    /// Number of sessions currently open
    #[inline]
    #[must_use]
    pub fn open_session_count(&self) -> usize {
        self.open_sessions.len()
    }

    /// Re-verify every tracked image
    #[must_use]
    pub fn report(&self) -> IntegrityReport {
        let mut expected: Vec<(PathBuf, ContentHash)> = self
            .baselines
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        expected.sort();

        let issues = verify_files(expected.iter().map(|(p, h)| (p.as_path(), *h)));
        if !issues.is_empty() {
            tracing::warn!(issues = issues.len(), "integrity report found divergent images");
        }

        IntegrityReport {
            images_tracked: expected.len(),
            monitoring_sessions: self.sessions_seen.load(Ordering::Relaxed),
            issues,
        }
    }
}
