//! Vault layout and embed resolution
//!
//! Turns the targets the scanner finds into concrete filesystem paths, and
//! decides where each image's backup copy lives inside a session directory.

use notesafe_integrity::ContentHash;
use notesafe_scanner::{EmbedSyntax, ImageEmbed};
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Directory (inside a session) for images that live outside the vault
const EXTERNAL_DIR: &str = "_external";

/// Where things live in a vault
#[derive(Debug, Clone)]
pub struct VaultLayout {
    root: PathBuf,
    backup_root: PathBuf,
    attachment_dirs: Vec<PathBuf>,
}

impl VaultLayout {
    /// Layout for a vault rooted at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, backup_dir_name: &str, attachment_dirs: &[PathBuf]) -> Self {
        let root = root.into();
        Self {
            backup_root: root.join(backup_dir_name),
            attachment_dirs: attachment_dirs.iter().map(|d| root.join(d)).collect(),
            root,
        }
    }

    /// Vault root
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one subdirectory per session
    #[inline]
    #[must_use]
    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Whether `path` lies inside the backup store
    #[must_use]
    pub fn is_backup_path(&self, path: &Path) -> bool {
        path.starts_with(&self.backup_root)
    }

    /// Resolve an embed found in `note_path` to an image path
    ///
    /// Markdown targets are tried relative to the note, then the vault root.
    /// Wiki targets additionally try each attachment directory and finally a
    /// vault-wide search by file name. If nothing exists, the note-relative
    /// path is returned so the caller reports it as missing.
    #[must_use]
    pub fn resolve(&self, note_path: &Path, embed: &ImageEmbed) -> PathBuf {
        let target = Path::new(&embed.target);
        let note_dir = note_path.parent().unwrap_or(&self.root);

        let mut candidates = Vec::new();
        if target.has_root() {
            candidates.push(target.to_path_buf());
            // Obsidian writes vault-absolute links as "/folder/image.png"
            if let Ok(stripped) = target.strip_prefix("/") {
                candidates.push(self.root.join(stripped));
            }
        } else {
            candidates.push(note_dir.join(target));
            candidates.push(self.root.join(target));
            if embed.syntax == EmbedSyntax::Wiki {
                candidates.extend(self.attachment_dirs.iter().map(|d| d.join(target)));
            }
        }

        let found = candidates
            .iter()
            .find(|c| c.is_file())
            .cloned()
            .or_else(|| {
                let single_name = target.components().count() == 1;
                (embed.syntax == EmbedSyntax::Wiki && single_name)
                    .then(|| self.find_by_name(target.as_os_str()))
                    .flatten()
            });

        match found {
            Some(path) => fs::canonicalize(&path).unwrap_or_else(|_| normalize(&path)),
            None => normalize(&candidates[0]),
        }
    }

    /// First file named `name` in a sorted walk of the vault
    ///
    /// Hidden directories and the backup store are skipped.
    fn find_by_name(&self, name: &std::ffi::OsStr) -> Option<PathBuf> {
        WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !(entry.file_type().is_dir()
                        && (entry.file_name().to_string_lossy().starts_with('.')
                            || entry.path() == self.backup_root))
            })
            .filter_map(Result::ok)
            .find(|entry| entry.file_type().is_file() && entry.file_name() == name)
            .map(walkdir::DirEntry::into_path)
    }

    /// Path of an image's copy relative to its session directory
    ///
    /// Images inside the vault keep their vault-relative path; anything else
    /// goes under `_external/<parent digest>/<file name>`.
    #[must_use]
    pub fn backup_relative_path(&self, image: &Path) -> PathBuf {
        if let Ok(relative) = image.strip_prefix(&self.root) {
            if !relative.as_os_str().is_empty() {
                return relative.to_path_buf();
            }
        }
        let parent = image.parent().unwrap_or_else(|| Path::new(""));
        let digest = ContentHash::compute(parent.to_string_lossy().as_bytes()).short();
        let file_name = image
            .file_name()
            .map_or_else(|| PathBuf::from("image"), PathBuf::from);
        PathBuf::from(EXTERNAL_DIR).join(digest).join(file_name)
    }
}

/// Lexically remove `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
