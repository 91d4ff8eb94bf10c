//! Provided-token extraction.
//!
//! Release names often carry a checksum tag such as `[A4DD1E71]`. The token is
//! stored as found and is never treated as a verified hash.

use regex::Regex;
use std::sync::LazyLock;

/// Exact length of a valid token, in hex characters.
pub const TOKEN_LEN: usize = 8;

static BRACKET_GROUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\[(]([^\[\]()]*)[\])]").unwrap());

/// Normalize a raw tag: strip delimiters, uppercase, require 8 hex chars.
///
/// ```
/// use reelsync_core::classifier::token::normalize_token;
///
/// assert_eq!(normalize_token("[a4dd1e71]").as_deref(), Some("A4DD1E71"));
/// assert_eq!(normalize_token("xyz"), None);
/// ```
pub fn normalize_token(raw: &str) -> Option<String> {
    let stripped = raw
        .trim()
        .trim_start_matches(['[', '('])
        .trim_end_matches([']', ')'])
        .trim();

    if stripped.len() == TOKEN_LEN && stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(stripped.to_ascii_uppercase())
    } else {
        None
    }
}

/// Find the provided token in a filename. The last valid bracketed group wins.
pub fn extract_provided_token(filename: &str) -> Option<String> {
    BRACKET_GROUP
        .captures_iter(filename)
        .filter_map(|caps| caps.get(1).and_then(|m| normalize_token(m.as_str())))
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_token() {
        assert_eq!(normalize_token("[A4DD1E71]").as_deref(), Some("A4DD1E71"));
        assert_eq!(normalize_token("(a4dd1e71)").as_deref(), Some("A4DD1E71"));
        assert_eq!(normalize_token("A4DD1E71").as_deref(), Some("A4DD1E71"));
        assert_eq!(normalize_token("[xyz]"), None);
        assert_eq!(normalize_token("xyz"), None);
        assert_eq!(normalize_token("[A4DD1E7]"), None);
        assert_eq!(normalize_token("[A4DD1E711]"), None);
        assert_eq!(normalize_token("[G4DD1E71]"), None);
        assert_eq!(normalize_token(""), None);
    }

    #[test]
    fn test_extract_from_filename() {
        assert_eq!(
            extract_provided_token("[Group] Show - 01 [1080p][A4DD1E71].mkv").as_deref(),
            Some("A4DD1E71")
        );
        assert_eq!(
            extract_provided_token("Show - 01 (deadbeef).mkv").as_deref(),
            Some("DEADBEEF")
        );
    }

    #[test]
    fn test_last_valid_group_wins() {
        assert_eq!(
            extract_provided_token("[11111111] Show - 01 [22222222].mkv").as_deref(),
            Some("22222222")
        );
    }

    #[test]
    fn test_absent_token() {
        assert_eq!(extract_provided_token("Show - 01 [1080p].mkv"), None);
        assert_eq!(extract_provided_token("Show.S01E01.mkv"), None);
    }
}
