//! Filesystem-safe names for staged and routed files.
//!
//! Unlike slug-style normalization this keeps case, spaces and punctuation
//! that every filesystem accepts, so library folders stay human-readable.

use regex::Regex;
use std::sync::LazyLock;

/// Maximum length of a single path component, in bytes.
const MAX_COMPONENT_LENGTH: usize = 200;

/// Reserved names on Windows NTFS.
const NTFS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// NTFS-reserved characters and control characters.
static ILLEGAL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]+"#).unwrap());

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static NON_ALNUM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Make `name` safe to use as one path component.
///
/// ```
/// use reelsync_core::naming::sanitize_component;
///
/// assert_eq!(sanitize_component("Show: The Movie?"), "Show The Movie");
/// assert_eq!(sanitize_component("  ..  "), "untitled");
/// ```
pub fn sanitize_component(name: &str) -> String {
    let cleaned = ILLEGAL_CHARS.replace_all(name, " ");
    let mut result = WHITESPACE.replace_all(cleaned.trim(), " ").into_owned();

    // Windows drops trailing dots and spaces silently.
    result = result.trim_end_matches(['.', ' ']).to_string();
    if result.chars().all(|c| c == '.') {
        result.clear();
    }

    if result.len() > MAX_COMPONENT_LENGTH {
        let mut cut = MAX_COMPONENT_LENGTH;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        result.truncate(cut);
        result = result.trim_end_matches(['.', ' ']).to_string();
    }

    let stem = result.split('.').next().unwrap_or("").to_uppercase();
    if NTFS_RESERVED_NAMES.contains(&stem.as_str()) {
        result.insert(0, '_');
    }

    if result.is_empty() {
        result = "untitled".to_string();
    }
    result
}

/// Folder name for a season inside a show directory.
pub fn season_directory(season: u32) -> String {
    format!("Season {:02}", season)
}

/// Case- and punctuation-insensitive key for comparing show names.
///
/// ```
/// use reelsync_core::naming::show_key;
///
/// assert_eq!(show_key("Re:Zero - Starting Life"), show_key("re zero starting life"));
/// ```
pub fn show_key(name: &str) -> String {
    NON_ALNUM.replace_all(&name.to_lowercase(), "").into_owned()
}
