//! Checksummed references to embedded images

use crate::hash::{ContentHash, HashError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One embedded image found in a note, with the checksum observed at scan time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    /// Resolved filesystem path of the image
    pub path: PathBuf,
    /// Blake3 checksum of the file content
    pub checksum: ContentHash,
}

impl ImageReference {
    /// Create a reference from an already-known checksum
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, checksum: ContentHash) -> Self {
        Self {
            path: path.into(),
            checksum,
        }
    }

    /// Read the file and record its current checksum
    ///
    /// # Errors
    /// Returns [`HashError::Io`] if the image is missing or unreadable.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, HashError> {
        let path = path.as_ref();
        let checksum = ContentHash::compute_file(path)?;
        Ok(Self::new(path, checksum))
    }

    /// Whether the file on disk still has the recorded checksum
    ///
    /// A missing or unreadable file counts as a mismatch.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        ContentHash::compute_file(&self.path).is_ok_and(|actual| actual == self.checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn from_file_then_modify_detects_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        fs::write(&path, b"original").unwrap();

        let reference = ImageReference::from_file(&path).unwrap();
        assert!(reference.is_intact());

        fs::write(&path, b"changed").unwrap();
        assert!(!reference.is_intact());

        fs::remove_file(&path).unwrap();
        assert!(!reference.is_intact());
    }
}
