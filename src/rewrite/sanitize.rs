//! Cleanup applied to generated replacement text before it is spliced in.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// `![alt]()` with nothing but whitespace as target.
#[allow(clippy::expect_used)]
static EMPTY_TARGET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!\[[^\]\n]*\]\([ \t]*\)").expect("empty target regex is valid")
});

/// `![alt]( url )` with padding around a bare target.
#[allow(clippy::expect_used)]
static PADDED_TARGET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(!\[[^\]\n]*\]\()[ \t]*([^\s)]+)[ \t]*\)").expect("padded target regex is valid")
});

/// Removes empty-target image residue and trims whitespace inside image targets.
///
/// Runs over replacement strings only, never over the surrounding document.
#[must_use]
pub fn sanitize(text: &str) -> Cow<'_, str> {
    let without_empty = EMPTY_TARGET_PATTERN.replace_all(text, "");
    if !PADDED_TARGET_PATTERN.is_match(&without_empty) {
        return without_empty;
    }
    let trimmed = PADDED_TARGET_PATTERN
        .replace_all(&without_empty, "${1}${2})")
        .into_owned();
    Cow::Owned(trimmed)
}
