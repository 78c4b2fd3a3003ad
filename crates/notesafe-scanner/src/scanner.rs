//! Embedded image extraction
//!
//! Recognizes two embed syntaxes:
//! - Markdown images: `![alt](path)`, `![alt](<path with spaces>)`, `![alt](path "title")`,
//!   `![alt](diagram(1).png)` (one level of balanced parentheses)
//! - Wiki embeds: `![[path]]`, `![[path|300]]`, `![[path#anchor]]`
//!
//! Anything inside fenced code blocks or inline code spans is ignored, remote
//! targets are skipped, and only targets with an image extension are reported.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

static MARKDOWN_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"!\[[^\]\n]*\]\(\s*(<[^>\n]+>|(?:[^()\s]|\([^()\s]*\))+)(?:\s+"[^"\n]*")?\s*\)"#)
        .unwrap_or_else(|e| unreachable!("markdown image pattern: {e}"))
});

static WIKI_EMBED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"!\[\[([^\[\]\n|#]+)(?:[|#][^\[\]\n]*)?\]\]")
        .unwrap_or_else(|e| unreachable!("wiki embed pattern: {e}"))
});

static INLINE_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"`[^`\n]+`").unwrap_or_else(|e| unreachable!("inline code pattern: {e}"))
});

/// Extensions treated as images when no custom list is given
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "svg", "bmp", "tif", "tiff", "heic", "avif",
];

/// Which syntax an embed was written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmbedSyntax {
    /// `![alt](path)`
    Markdown,
    /// `![[path]]`
    Wiki,
}

/// An image target found in note text, before resolution against the vault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEmbed {
    /// Target as written, with decorations (title, size, anchor) removed
    pub target: String,
    /// Syntax the embed used
    pub syntax: EmbedSyntax,
    /// Byte offset of the `!` that opens the embed
    pub offset: usize,
}

/// Scanner for embedded image references
///
/// Pure and infallible: malformed embeds simply do not match.
#[derive(Debug, Clone)]
pub struct ImageReferenceScanner {
    extensions: Vec<String>,
}

impl Default for ImageReferenceScanner {
    fn default() -> Self {
        Self::with_extensions(DEFAULT_IMAGE_EXTENSIONS.iter().copied())
    }
}

impl ImageReferenceScanner {
    /// Scanner with the default image extensions
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scanner recognizing a custom set of extensions (case-insensitive)
    #[must_use]
    pub fn with_extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Extract image embeds in order of appearance, deduplicated by target
    #[must_use]
    pub fn scan(&self, note_text: &str) -> Vec<ImageEmbed> {
        if note_text.is_empty() {
            return Vec::new();
        }
        let masked = mask_code(note_text);

        let markdown = MARKDOWN_IMAGE.captures_iter(&masked).filter_map(|caps| {
            let whole = caps.get(0)?;
            let raw = caps.get(1)?.as_str();
            let raw = raw
                .strip_prefix('<')
                .and_then(|r| r.strip_suffix('>'))
                .unwrap_or(raw);
            Some((whole.start(), EmbedSyntax::Markdown, percent_decode(raw.trim())))
        });
        let wiki = WIKI_EMBED.captures_iter(&masked).filter_map(|caps| {
            let whole = caps.get(0)?;
            let raw = caps.get(1)?.as_str().trim().to_string();
            Some((whole.start(), EmbedSyntax::Wiki, raw))
        });

        let mut found: Vec<(usize, EmbedSyntax, String)> = markdown
            .chain(wiki)
            .filter(|(_, _, target)| !target.is_empty() && !is_remote(target))
            .filter(|(_, _, target)| self.is_image(target))
            .collect();
        found.sort_by_key(|(offset, _, _)| *offset);

        let mut unique: IndexMap<String, ImageEmbed> = IndexMap::new();
        for (offset, syntax, target) in found {
            unique.entry(target.clone()).or_insert(ImageEmbed {
                target,
                syntax,
                offset,
            });
        }
        unique.into_values().collect()
    }

    /// Distinct targets only
    #[must_use]
    pub fn scan_paths(&self, note_text: &str) -> Vec<String> {
        self.scan(note_text).into_iter().map(|e| e.target).collect()
    }

    /// Whether a target has one of the configured image extensions
    #[must_use]
    pub fn is_image(&self, target: &str) -> bool {
        Path::new(target)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|known| *known == ext)
            })
    }
}

fn is_remote(target: &str) -> bool {
    target.contains("://") || target.starts_with("data:") || target.starts_with("mailto:")
}

/// Blank out fenced code blocks and inline code spans, keeping byte offsets
fn mask_code(text: &str) -> String {
    let mut bytes = text.as_bytes().to_vec();
    let mut fence: Option<&str> = None;
    let mut line_start = 0;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let marker = if trimmed.starts_with("```") {
            Some("```")
        } else if trimmed.starts_with("~~~") {
            Some("~~~")
        } else {
            None
        };

        let in_block = match (fence, marker) {
            (None, Some(m)) => {
                fence = Some(m);
                true
            }
            (Some(open), Some(m)) if open == m => {
                fence = None;
                true
            }
            (Some(_), _) => true,
            (None, None) => false,
        };

        if in_block {
            blank(&mut bytes[line_start..line_start + line.len()]);
        }
        line_start += line.len();
    }

    // Offsets are unchanged and only whole characters were blanked, so the
    // intermediate text is valid UTF-8.
    let partially = String::from_utf8_lossy(&bytes).into_owned();
    for span in INLINE_CODE.find_iter(&partially) {
        blank(&mut bytes[span.start()..span.end()]);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn blank(region: &mut [u8]) {
    for b in region.iter_mut().filter(|b| **b != b'\n') {
        *b = b' ';
    }
}

/// Decode `%XX` escapes; leaves the input untouched if decoding is not valid UTF-8
fn percent_decode(raw: &str) -> String {
    if !raw.contains('%') {
        return raw.to_string();
    }
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = raw.get(i + 1..i + 3).and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(value) = hex {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| raw.to_string())
}
