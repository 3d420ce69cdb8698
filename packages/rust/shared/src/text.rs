//! Free-text normalization applied to every scraped text field.
//!
//! Two passes, in order:
//! 1. Drop every character in the Unicode `Symbol` general category
//!    (`Sm`, `Sc`, `Sk`, `So`): emoji, dingbats, currency and math signs.
//! 2. Collapse each run of Unicode whitespace (newlines included) to a single
//!    ASCII space and trim both ends.
//!
//! The result contains no symbols and no whitespace runs, so running it again
//! is a no-op.

use std::sync::LazyLock;

use regex::Regex;

static SYMBOL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\p{S}+").expect("valid regex"));

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Normalize free text. Total and deterministic.
pub fn normalize(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let stripped = SYMBOL_RE.replace_all(text, "");
    let collapsed = WHITESPACE_RE.replace_all(&stripped, " ");
    collapsed.trim().to_string()
}

/// Like [`normalize`], treating a missing value as empty.
pub fn normalize_opt(text: Option<&str>) -> String {
    text.map(normalize).unwrap_or_default()
}

/// Normalize a list of labels, dropping the ones that end up empty.
pub fn normalize_all<I, S>(labels: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    labels
        .into_iter()
        .map(|l| normalize(l.as_ref()))
        .filter(|l| !l.is_empty())
        .collect()
}
