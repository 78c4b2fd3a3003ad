//! notesafe scanner
//!
//! Finds the images a markdown note embeds, so they can be protected before
//! the note is mutated.
//!
//! ```rust,ignore
//! use notesafe_scanner::ImageReferenceScanner;
//!
//! let scanner = ImageReferenceScanner::new();
//! let embeds = scanner.scan("See ![[whiteboard.png]] and ![chart](img/q3.svg)");
//! assert_eq!(embeds.len(), 2);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod scanner;

pub use scanner::{EmbedSyntax, ImageEmbed, ImageReferenceScanner, DEFAULT_IMAGE_EXTENSIONS};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
