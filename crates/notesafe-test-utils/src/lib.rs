//! Testing utilities for the notesafe workspace
//!
//! Temporary vaults and mutator doubles shared by integration tests and
//! benches.

#![allow(missing_docs)]

use notesafe_engine::{EngineConfig, MutationOutcome, NoteMutator, SafeProcessor};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Bytes written over an image by the corrupting doubles
pub const CORRUPTED: &[u8] = b"corrupted by test mutator";

/// A vault in a temporary directory
///
/// The root is canonicalized so paths compare equal to those the engine
/// reports.
#[derive(Debug)]
pub struct VaultFixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Default for VaultFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl VaultFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        Self { _dir: dir, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    pub fn backup_root(&self) -> PathBuf {
        self.root.join(".backups")
    }

    pub fn write(&self, rel: impl AsRef<Path>, bytes: impl AsRef<[u8]>) -> PathBuf {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, bytes).unwrap();
        path
    }

    pub fn write_note(&self, rel: impl AsRef<Path>, text: &str) -> PathBuf {
        self.write(rel, text)
    }

    /// Write an image whose bytes are derived from its name
    pub fn write_image(&self, rel: &str) -> PathBuf {
        self.write(rel, image_bytes(rel))
    }

    /// Write `images` and a note embedding each of them with markdown syntax
    pub fn note_with_images(&self, note: &str, images: &[&str]) -> (PathBuf, Vec<PathBuf>) {
        let paths: Vec<PathBuf> = images.iter().map(|rel| self.write_image(rel)).collect();
        let mut text = format!("# {note}\n\n");
        for rel in images {
            text.push_str(&format!("![{rel}]({rel})\n"));
        }
        (self.write_note(note, &text), paths)
    }

    pub fn read(&self, rel: impl AsRef<Path>) -> Vec<u8> {
        fs::read(self.path(rel)).unwrap()
    }

    pub fn read_note(&self, rel: impl AsRef<Path>) -> String {
        fs::read_to_string(self.path(rel)).unwrap()
    }

    /// Session directories currently in the backup store
    pub fn session_dirs(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(self.backup_root()) else {
            return Vec::new();
        };
        let mut dirs: Vec<PathBuf> = entries
            .map(|e| e.unwrap().path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        dirs
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig::new(&self.root)
    }

    pub fn processor(&self) -> SafeProcessor {
        SafeProcessor::new(self.config()).unwrap()
    }

    pub fn processor_with(&self, configure: impl FnOnce(EngineConfig) -> EngineConfig) -> SafeProcessor {
        SafeProcessor::new(configure(self.config())).unwrap()
    }
}

/// Deterministic per-name image content
pub fn image_bytes(name: &str) -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(name.as_bytes());
    bytes.extend((0..256_u16).map(|i| (i as u8).wrapping_mul(31)));
    bytes
}

fn corrupt_all(paths: &[PathBuf]) {
    for path in paths {
        fs::write(path, CORRUPTED).unwrap();
    }
}

fn append(note: &Path, line: &str) -> std::io::Result<()> {
    let mut text = fs::read_to_string(note)?;
    text.push_str(line);
    text.push('\n');
    fs::write(note, text)
}

/// Appends a line to the note and commits
#[derive(Debug, Clone)]
pub struct AppendingMutator {
    pub line: String,
}

impl AppendingMutator {
    pub fn new(line: impl Into<String>) -> Self {
        Self { line: line.into() }
    }
}

impl NoteMutator for AppendingMutator {
    fn apply(&self, note_path: &Path) -> anyhow::Result<MutationOutcome> {
        append(note_path, &self.line)?;
        Ok(MutationOutcome::Success)
    }

    fn name(&self) -> &str {
        "append"
    }
}

/// Overwrites some images, then returns an error
#[derive(Debug, Clone, Default)]
pub struct FailingMutator {
    pub corrupt: Vec<PathBuf>,
}

impl FailingMutator {
    pub fn corrupting(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            corrupt: paths.into_iter().collect(),
        }
    }
}

impl NoteMutator for FailingMutator {
    fn apply(&self, note_path: &Path) -> anyhow::Result<MutationOutcome> {
        corrupt_all(&self.corrupt);
        append(note_path, "half-applied edit")?;
        anyhow::bail!("simulated mutation failure")
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Overwrites some images, then reports an explicit failure outcome
#[derive(Debug, Clone, Default)]
pub struct RejectingMutator {
    pub corrupt: Vec<PathBuf>,
}

impl NoteMutator for RejectingMutator {
    fn apply(&self, _note_path: &Path) -> anyhow::Result<MutationOutcome> {
        corrupt_all(&self.corrupt);
        Ok(MutationOutcome::failure("quality gate rejected the note"))
    }

    fn name(&self) -> &str {
        "rejecting"
    }
}

/// Overwrites some images, then panics
#[derive(Debug, Clone, Default)]
pub struct PanickingMutator {
    pub corrupt: Vec<PathBuf>,
}

impl NoteMutator for PanickingMutator {
    fn apply(&self, _note_path: &Path) -> anyhow::Result<MutationOutcome> {
        corrupt_all(&self.corrupt);
        panic!("simulated mutator panic");
    }

    fn name(&self) -> &str {
        "panicking"
    }
}

/// Overwrites some images, sleeps, and commits
#[derive(Debug, Clone)]
pub struct SlowMutator {
    pub delay: Duration,
    pub corrupt: Vec<PathBuf>,
}

impl NoteMutator for SlowMutator {
    fn apply(&self, _note_path: &Path) -> anyhow::Result<MutationOutcome> {
        corrupt_all(&self.corrupt);
        thread::sleep(self.delay);
        Ok(MutationOutcome::Success)
    }

    fn name(&self) -> &str {
        "slow"
    }
}

/// Records every note it sees and commits
#[derive(Debug, Default)]
pub struct RecordingMutator {
    calls: Mutex<Vec<PathBuf>>,
}

impl RecordingMutator {
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().clone()
    }
}

impl NoteMutator for RecordingMutator {
    fn apply(&self, note_path: &Path) -> anyhow::Result<MutationOutcome> {
        self.calls.lock().push(note_path.to_path_buf());
        Ok(MutationOutcome::Success)
    }

    fn name(&self) -> &str {
        "recording"
    }
}
