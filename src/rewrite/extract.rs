//! Image reference extraction from Markdown text.
//!
//! Two regex passes run first: hyperlinked images `[![alt](url)](link)`, then
//! plain images `![alt](url "title")`. A plain match overlapping a hyperlinked
//! one is discarded. Inputs at or above `linear_scan_threshold` bytes also get
//! a character scan that re-derives references the patterns do not cover
//! (escaped brackets in alt text, single-quoted titles) and merges any
//! non-overlapping spans.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::{debug, trace};

use crate::config::{DEFAULT_LINEAR_SCAN_THRESHOLD, DEFAULT_MAX_MATCHES};

#[allow(clippy::expect_used)]
static LINKED_IMAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[!\[([^\]]*)\]\(([^\s)]+)(?:\s+"[^"]*")?\)\]\(([^\s)]+)(?:\s+"[^"]*")?\)"#)
        .expect("linked image regex is valid")
});

#[allow(clippy::expect_used)]
static IMAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"!\[([^\]]*)\]\(([^\s)]+)(?:\s+"[^"]*")?\)"#).expect("image regex is valid")
});

/// One image reference and the exact span of text it occupies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetReference {
    /// `text[start..end]`.
    pub full_text: String,
    /// Image target, without any title.
    pub url: String,
    /// Text between the image brackets.
    pub alt_text: String,
    /// Position among all references of the text, in order of appearance.
    pub index: usize,
    /// Byte offset of the first character.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    /// Target of the wrapping link, when the image is hyperlinked.
    pub link_url: Option<String>,
}

impl AssetReference {
    fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }
}

/// Bounds applied by [`extract_references`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionLimits {
    /// Extraction stops after this many references.
    pub max_matches: usize,
    /// Inputs at least this many bytes long also get the linear scan.
    pub linear_scan_threshold: usize,
}

impl Default for ExtractionLimits {
    fn default() -> Self {
        Self {
            max_matches: DEFAULT_MAX_MATCHES,
            linear_scan_threshold: DEFAULT_LINEAR_SCAN_THRESHOLD,
        }
    }
}

/// Extracts image references sorted by start offset and indexed sequentially.
///
/// # Examples
///
/// ```
/// use imgsync_core::rewrite::{ExtractionLimits, extract_references};
///
/// let refs = extract_references("[![a](u1)](l1)", &ExtractionLimits::default());
/// assert_eq!(refs.len(), 1);
/// assert_eq!(refs[0].url, "u1");
/// assert_eq!(refs[0].link_url.as_deref(), Some("l1"));
/// ```
#[tracing::instrument(skip(text, limits), fields(text_len = text.len()))]
#[must_use]
pub fn extract_references(text: &str, limits: &ExtractionLimits) -> Vec<AssetReference> {
    let mut found: Vec<AssetReference> = Vec::new();

    for caps in LINKED_IMAGE_PATTERN.captures_iter(text) {
        if found.len() >= limits.max_matches {
            break;
        }
        found.push(from_captures(&caps, true));
    }

    for caps in IMAGE_PATTERN.captures_iter(text) {
        if found.len() >= limits.max_matches {
            break;
        }
        let candidate = from_captures(&caps, false);
        if found
            .iter()
            .any(|existing| existing.overlaps(candidate.start, candidate.end))
        {
            trace!(start = candidate.start, "plain match inside linked match, skipping");
            continue;
        }
        found.push(candidate);
    }

    if text.len() >= limits.linear_scan_threshold && found.len() < limits.max_matches {
        let before = found.len();
        for candidate in linear_scan(text) {
            if found.len() >= limits.max_matches {
                break;
            }
            if found
                .iter()
                .any(|existing| existing.overlaps(candidate.start, candidate.end))
            {
                continue;
            }
            found.push(candidate);
        }
        if found.len() > before {
            debug!(recovered = found.len() - before, "linear scan recovered references");
        }
    }

    if found.len() >= limits.max_matches {
        debug!(max_matches = limits.max_matches, "reference cap reached");
    }

    found.sort_by_key(|reference| reference.start);
    for (index, reference) in found.iter_mut().enumerate() {
        reference.index = index;
    }
    found
}

fn from_captures(caps: &Captures<'_>, linked: bool) -> AssetReference {
    let (start, end, full) = caps
        .get(0)
        .map_or((0, 0, ""), |m| (m.start(), m.end(), m.as_str()));
    let group = |i: usize| caps.get(i).map_or("", |m| m.as_str()).to_string();
    AssetReference {
        full_text: full.to_string(),
        url: group(2),
        alt_text: group(1),
        index: 0,
        start,
        end,
        link_url: linked.then(|| group(3)),
    }
}

/// Finds `![alt](target)` by walking the bytes, honoring backslash escapes.
///
/// Delimiters are ASCII, so every offset produced here is a char boundary.
fn linear_scan(text: &str) -> Vec<AssetReference> {
    let bytes = text.as_bytes();
    let mut references = Vec::new();
    let mut pos = 0;

    while let Some(offset) = text[pos..].find("![") {
        let start = pos + offset;
        pos = start + 2;

        let Some(alt_end) = find_unescaped(bytes, start + 2, b']') else {
            continue;
        };
        if bytes.get(alt_end + 1) != Some(&b'(') {
            continue;
        }
        let Some(close) = find_unescaped(bytes, alt_end + 2, b')') else {
            continue;
        };
        let Some(url) = text[alt_end + 2..close].split_whitespace().next() else {
            continue;
        };

        let mut reference = AssetReference {
            full_text: String::new(),
            url: url.to_string(),
            alt_text: text[start + 2..alt_end].to_string(),
            index: 0,
            start,
            end: close + 1,
            link_url: None,
        };

        // [![alt](url)](link)
        if start > 0
            && bytes[start - 1] == b'['
            && text[reference.end..].starts_with("](")
            && let Some(link_close) = find_unescaped(bytes, reference.end + 2, b')')
            && let Some(link) = text[reference.end + 2..link_close].split_whitespace().next()
        {
            reference.link_url = Some(link.to_string());
            reference.start = start - 1;
            reference.end = link_close + 1;
        }

        reference.full_text = text[reference.start..reference.end].to_string();
        pos = reference.end;
        references.push(reference);
    }

    references
}

/// Position of the first unescaped `target` at or after `from`, within the line.
fn find_unescaped(bytes: &[u8], from: usize, target: u8) -> Option<usize> {
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return None,
            b if b == target => return Some(i),
            _ => i += 1,
        }
    }
    None
}
