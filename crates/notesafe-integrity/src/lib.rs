//! notesafe integrity primitives
//!
//! Checksums and integrity monitoring for the images embedded in vault notes.
//!
//! # Core Concepts
//!
//! - [`ContentHash`]: 32-byte Blake3 checksum of a file's bytes
//! - [`ImageReference`]: an embedded image path plus the checksum seen at scan time
//! - [`IntegrityMonitor`]: baselines per image, re-verified into an [`IntegrityReport`]
//!
//! # Example
//!
//! ```rust,ignore
//! use notesafe_integrity::{ImageReference, IntegrityMonitor};
//!
//! let monitor = IntegrityMonitor::new();
//! let image = ImageReference::from_file("vault/attachments/diagram.png")?;
//! monitor.begin_session("retag-1", &[image]);
//!
//! let report = monitor.report();
//! assert!(report.is_clean());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod hash;
mod monitor;
mod reference;

pub use hash::{ContentHash, HashError};
pub use monitor::{verify_files, IntegrityIssue, IntegrityMonitor, IntegrityReport};
pub use reference::ImageReference;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
