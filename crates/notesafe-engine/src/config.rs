//! Engine configuration
//!
//! [`EngineConfig`] can be built in code with the `with_*` helpers or loaded
//! from TOML:
//!
//! ```toml
//! vault_root = "/home/me/vault"
//! retain_backups_after_commit = false
//! processing_timeout_ms = 30000
//! missing_image_policy = "skip"
//!
//! [lock_policy]
//! mode = "wait"
//! timeout_ms = 5000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do when another session holds the lock on a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LockPolicy {
    /// Fail immediately with a concurrency error
    FailFast,
    /// Block until the lock is released or the timeout elapses
    Wait {
        /// Maximum wait in milliseconds
        timeout_ms: u64,
    },
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::FailFast
    }
}

/// What to do when a note embeds an image that does not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingImagePolicy {
    /// Refuse to process the note
    #[default]
    Fail,
    /// Log and leave the broken embed out of the protected set
    Skip,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory of the vault
    pub vault_root: PathBuf,
    /// Directory under the vault root that holds session backups
    pub backup_dir_name: String,
    /// Keep backup copies after a successful commit
    pub retain_backups_after_commit: bool,
    /// Lock contention policy
    pub lock_policy: LockPolicy,
    /// Budget for a mutation callback, in milliseconds; none means unbounded
    pub processing_timeout_ms: Option<u64>,
    /// How long to wait for a timed-out callback to stop before rolling back
    pub timeout_grace_ms: u64,
    /// Broken embed policy
    pub missing_image_policy: MissingImagePolicy,
    /// Vault-relative directories searched for wiki embeds
    pub attachment_dirs: Vec<PathBuf>,
    /// Image file extensions recognized by the scanner
    pub image_extensions: Vec<String>,
    /// Worker threads for parallel batches; 0 uses the global rayon pool
    pub parallelism: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vault_root: PathBuf::from("."),
            backup_dir_name: ".backups".to_string(),
            retain_backups_after_commit: true,
            lock_policy: LockPolicy::FailFast,
            processing_timeout_ms: None,
            timeout_grace_ms: 2_000,
            missing_image_policy: MissingImagePolicy::Fail,
            attachment_dirs: ["attachments", "assets", "images", "media"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            image_extensions: notesafe_scanner::DEFAULT_IMAGE_EXTENSIONS
                .iter()
                .map(|e| (*e).to_string())
                .collect(),
            parallelism: 0,
        }
    }
}

impl EngineConfig {
    /// Default configuration rooted at `vault_root`
    #[inline]
    #[must_use]
    pub fn new(vault_root: impl Into<PathBuf>) -> Self {
        Self {
            vault_root: vault_root.into(),
            ..Self::default()
        }
    }

    /// With backup retention after commit
    #[inline]
    #[must_use]
    pub fn with_retain_backups(mut self, retain: bool) -> Self {
        self.retain_backups_after_commit = retain;
        self
    }

    /// With lock contention policy
    #[inline]
    #[must_use]
    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    /// With a processing timeout for mutation callbacks
    #[inline]
    #[must_use]
    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout_ms = Some(duration_ms(timeout));
        self
    }

    /// With grace period for timed-out callbacks
    #[inline]
    #[must_use]
    pub fn with_timeout_grace(mut self, grace: Duration) -> Self {
        self.timeout_grace_ms = duration_ms(grace);
        self
    }

    /// With missing image policy
    #[inline]
    #[must_use]
    pub fn with_missing_image_policy(mut self, policy: MissingImagePolicy) -> Self {
        self.missing_image_policy = policy;
        self
    }

    /// With backup directory name
    #[inline]
    #[must_use]
    pub fn with_backup_dir_name(mut self, name: impl Into<String>) -> Self {
        self.backup_dir_name = name.into();
        self
    }

    /// With worker count for parallel batches
    #[inline]
    #[must_use]
    pub fn with_parallelism(mut self, threads: usize) -> Self {
        self.parallelism = threads;
        self
    }

    /// Processing timeout as a duration
    #[must_use]
    pub fn processing_timeout(&self) -> Option<Duration> {
        self.processing_timeout_ms.map(Duration::from_millis)
    }

    /// Timeout grace as a duration
    #[must_use]
    pub fn timeout_grace(&self) -> Duration {
        Duration::from_millis(self.timeout_grace_ms)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] if validation fails.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    ///
    /// Relative `vault_root` values are resolved against the file's directory.
    ///
    /// # Errors
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`EngineConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if config.vault_root.is_relative() {
            if let Some(dir) = path.parent() {
                config.vault_root = dir.join(&config.vault_root);
            }
        }
        Ok(config)
    }

    /// Check internal consistency
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vault_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("vault_root is empty".into()));
        }
        let name = self.backup_dir_name.as_str();
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "backup_dir_name must be a single directory name, got {name:?}"
            )));
        }
        if self.processing_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "processing_timeout_ms must be positive".into(),
            ));
        }
        if self.image_extensions.is_empty() {
            return Err(ConfigError::Invalid("image_extensions is empty".into()));
        }
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML could not be parsed
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file could not be read
    #[error("io error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Values are inconsistent
    #[error("{0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_conservative() {
        let config = EngineConfig::default();
        assert_eq!(config.backup_dir_name, ".backups");
        assert!(config.retain_backups_after_commit);
        assert_eq!(config.lock_policy, LockPolicy::FailFast);
        assert_eq!(config.missing_image_policy, MissingImagePolicy::Fail);
        assert!(config.processing_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_helpers() {
        let config = EngineConfig::new("/vault")
            .with_retain_backups(false)
            .with_processing_timeout(Duration::from_millis(250))
            .with_lock_policy(LockPolicy::Wait { timeout_ms: 10 });
        assert_eq!(config.vault_root, PathBuf::from("/vault"));
        assert!(!config.retain_backups_after_commit);
        assert_eq!(config.processing_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn parses_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            vault_root = "/notes"
            retain_backups_after_commit = false
            missing_image_policy = "skip"
            processing_timeout_ms = 1500

            [lock_policy]
            mode = "wait"
            timeout_ms = 200
            "#,
        )
        .unwrap();

        assert_eq!(config.vault_root, PathBuf::from("/notes"));
        assert_eq!(config.missing_image_policy, MissingImagePolicy::Skip);
        assert_eq!(config.lock_policy, LockPolicy::Wait { timeout_ms: 200 });
        assert_eq!(config.backup_dir_name, ".backups");
        assert_eq!(config.processing_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn rejects_nested_backup_dir() {
        let config = EngineConfig::new("/v").with_backup_dir_name("a/b");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            EngineConfig::from_toml_str("vault_root = "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn from_file_resolves_relative_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notesafe.toml");
        std::fs::write(&path, "vault_root = \"vault\"\n").unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.vault_root, dir.path().join("vault"));
    }
}
