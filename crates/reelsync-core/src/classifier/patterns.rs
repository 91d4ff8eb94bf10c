//! Deterministic filename parsing.
//!
//! Pure and I/O free: the same filename always yields the same result.
//! Rules are tried in order and the first match wins. A season is only ever
//! reported when the text spells one out.

use crate::models::Classification;
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// Confidence reported when no rule matches.
pub const NO_MATCH_CONFIDENCE: f64 = 0.1;

/// Extensions are at most this long and must contain a letter.
const MAX_EXTENSION_LEN: usize = 4;

static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)|\{[^}]*\}").unwrap());

static SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[._]+").unwrap());

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static SEASON_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:^|[\s-])(?:s\d{1,2}(?:e\d|\b)|season[\s-]*\d{1,2}\b|\d{1,2}(?:st|nd|rd|th)?[\s-]+season\b|\d{1,2}x\d{2,3}\b)",
    )
    .unwrap()
});

struct PatternRule {
    name: &'static str,
    regex: Regex,
    confidence: f64,
}

impl PatternRule {
    fn new(name: &'static str, pattern: &str, confidence: f64) -> Self {
        Self {
            name,
            regex: Regex::new(pattern).unwrap(),
            confidence,
        }
    }
}

// Capture groups: `name`, `episode`, and one of `season`, `season_alt`,
// `season_ord` depending on how the season was spelled.
static RULES: LazyLock<Vec<PatternRule>> = LazyLock::new(|| {
    vec![
        PatternRule::new(
            "ordinal_season",
            r"(?i)^(?P<name>.+?)[\s-]+(?P<season>\d{1,2})(?:st|nd|rd|th)?[\s-]+season[\s-]+(?:(?:episode|ep|e)[\s-]*)?(?P<episode>\d{1,4})(?:v\d+)?\b",
            0.85,
        ),
        PatternRule::new(
            "sxxexx",
            r"(?i)^(?P<name>.+?)[\s-]+s(?P<season>\d{1,2})[\s-]*e(?P<episode>\d{1,4})(?:-?e\d{1,4})*(?:v\d+)?\b",
            0.95,
        ),
        PatternRule::new(
            "season_x_episode",
            r"(?i)^(?P<name>.+?)[\s-]+(?P<season>\d{1,2})x(?P<episode>\d{2,3})\b",
            0.9,
        ),
        PatternRule::new(
            "season_word_episode",
            r"(?i)^(?P<name>.+?)[\s-]+season[\s-]*(?P<season>\d{1,2})[\s-]+(?:(?:episode|ep|e)[\s-]*)?(?P<episode>\d{1,4})(?:v\d+)?\b",
            0.85,
        ),
        PatternRule::new(
            "season_dash_episode",
            r"(?i)^(?P<name>.+?)[\s-]+s(?P<season>\d{1,2})[\s-]+(?:(?:episode|ep|e)[\s-]*)?(?P<episode>\d{1,4})(?:v\d+)?\b",
            0.85,
        ),
        PatternRule::new(
            "episode_marker",
            r"(?i)^(?P<name>.+?)(?:[\s-]+s(?P<season>\d{1,2}))?[\s-]+(?:episode|ep|e)[\s-]*(?P<episode>\d{1,4})(?:v\d+)?\b",
            0.75,
        ),
        PatternRule::new(
            "season_only",
            r"(?i)^(?P<name>.+?)[\s-]+(?:s(?P<season>\d{1,2})|season[\s-]*(?P<season_alt>\d{1,2})|(?P<season_ord>\d{1,2})(?:st|nd|rd|th)[\s-]+season)\b",
            Classification::SEASON_ONLY_CONFIDENCE,
        ),
        PatternRule::new(
            "dash_number",
            r"(?i)^(?P<name>.+)\s+-\s+(?P<episode>\d{1,4})(?:v\d+)?\b",
            0.6,
        ),
        PatternRule::new(
            "trailing_number",
            r"(?i)^(?P<name>.+?)[\s-]+(?P<episode>\d{1,3})(?:v\d+)?$",
            0.5,
        ),
    ]
});

/// Strip the extension and release tags and turn separators into spaces.
///
/// ```
/// use reelsync_core::classifier::patterns::normalize_filename;
///
/// assert_eq!(normalize_filename("[Grp] Show_Name.S01E02 [1080p].mkv"), "Show Name S01E02");
/// ```
pub fn normalize_filename(filename: &str) -> String {
    let stem = strip_extension(filename);
    let without_tags = BRACKETED.replace_all(stem, " ");
    let spaced = SEPARATORS.replace_all(&without_tags, " ");
    WHITESPACE.replace_all(spaced.trim(), " ").into_owned()
}

fn strip_extension(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => {
            let ext = &filename[idx + 1..];
            let looks_like_extension = !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
                && ext.chars().any(|c| c.is_ascii_alphabetic());
            if looks_like_extension {
                &filename[..idx]
            } else {
                filename
            }
        }
        _ => filename,
    }
}

/// Whether the filename spells out a season.
pub fn has_season_marker(filename: &str) -> bool {
    SEASON_MARKER.is_match(&normalize_filename(filename))
}

/// Run the rule list against `filename`.
pub fn classify(filename: &str) -> Classification {
    let normalized = normalize_filename(filename);

    for rule in RULES.iter() {
        let Some(caps) = rule.regex.captures(&normalized) else {
            continue;
        };
        let show_name = clean_show_name(caps.name("name").map(|m| m.as_str()).unwrap_or(""));
        if show_name.is_empty() {
            continue;
        }
        let season = capture_number(&caps, &["season", "season_alt", "season_ord"]);
        let episode = capture_number(&caps, &["episode"]);

        return Classification::deterministic(
            show_name,
            season,
            episode,
            rule.confidence,
            format!("matched rule '{}'", rule.name),
        );
    }

    Classification::deterministic(
        normalized,
        None,
        None,
        NO_MATCH_CONFIDENCE,
        "no pattern matched",
    )
}

fn capture_number(caps: &Captures<'_>, groups: &[&str]) -> Option<u32> {
    groups
        .iter()
        .find_map(|g| caps.name(g))
        .and_then(|m| m.as_str().parse().ok())
}

fn clean_show_name(raw: &str) -> String {
    let trimmed = raw.trim_matches(|c: char| c.is_whitespace() || c == '-');
    WHITESPACE.replace_all(trimmed, " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(filename: &str) -> (String, Option<u32>, Option<u32>) {
        let c = classify(filename);
        (c.show_name, c.season, c.episode)
    }

    #[test]
    fn test_sxxexx() {
        let c = classify("Show.Name.S02E05.mkv");
        assert_eq!(c.show_name, "Show Name");
        assert_eq!(c.season, Some(2));
        assert_eq!(c.episode, Some(5));
        assert!(c.confidence >= 0.9);
    }

    #[test]
    fn test_dash_number_has_no_season() {
        let c = classify("Show - 07.mkv");
        assert_eq!(c.show_name, "Show");
        assert_eq!(c.season, None);
        assert_eq!(c.episode, Some(7));
    }

    #[test]
    fn test_ordinal_season() {
        assert_eq!(
            parts("Show.3rd.Season.12.mkv"),
            ("Show".to_string(), Some(3), Some(12))
        );
    }

    #[test]
    fn test_release_group_and_tags_ignored() {
        assert_eq!(
            parts("[SubsPlease] Some Show - 11 (1080p) [A4DD1E71].mkv"),
            ("Some Show".to_string(), None, Some(11))
        );
    }

    #[test]
    fn test_other_season_spellings() {
        assert_eq!(parts("Show 1x05.mkv"), ("Show".to_string(), Some(1), Some(5)));
        assert_eq!(parts("Show Season 2 - 05.mkv"), ("Show".to_string(), Some(2), Some(5)));
        assert_eq!(parts("Show S01 - 03.mkv"), ("Show".to_string(), Some(1), Some(3)));
        assert_eq!(parts("Show.S01E02E03.mkv"), ("Show".to_string(), Some(1), Some(2)));
    }

    #[test]
    fn test_episode_marker() {
        assert_eq!(parts("Show E07.mkv"), ("Show".to_string(), None, Some(7)));
        assert_eq!(parts("Show Ep 7.mkv"), ("Show".to_string(), None, Some(7)));
    }

    #[test]
    fn test_number_in_title_uses_last_dash_number() {
        assert_eq!(
            parts("Mob Psycho 100 - 05.mkv"),
            ("Mob Psycho 100".to_string(), None, Some(5))
        );
    }

    #[test]
    fn test_season_without_episode() {
        for name in ["Show S02.mkv", "Show Season 2.mkv", "Show 2nd Season.mkv"] {
            let c = classify(name);
            assert_eq!(c.season, Some(2), "{name}");
            assert_eq!(c.episode, None, "{name}");
            assert!(c.confidence <= 0.5, "{name}");
        }
    }

    #[test]
    fn test_resolution_and_year_are_not_episodes() {
        let c = classify("Show 1080p.mkv");
        assert_eq!(c.episode, None);
        let c = classify("Show 2019.mkv");
        assert_eq!(c.episode, None);
    }

    #[test]
    fn test_no_match() {
        let c = classify("Just A Movie.mkv");
        assert_eq!(c.show_name, "Just A Movie");
        assert_eq!(c.season, None);
        assert_eq!(c.episode, None);
        assert!((c.confidence - NO_MATCH_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[test]
    fn test_is_pure() {
        let a = classify("Show.Name.S02E05.mkv");
        let b = classify("Show.Name.S02E05.mkv");
        assert_eq!(a, b);
    }

    #[test]
    fn test_strip_extension_keeps_numeric_suffix() {
        assert_eq!(normalize_filename("Show.3rd.Season.12"), "Show 3rd Season 12");
        assert_eq!(normalize_filename("Show - 07.mp4"), "Show - 07");
    }

    #[test]
    fn test_has_season_marker() {
        assert!(has_season_marker("Show.S02E05.mkv"));
        assert!(has_season_marker("Show Season 3.mkv"));
        assert!(has_season_marker("Show 2nd Season - 04.mkv"));
        assert!(has_season_marker("Show 1x05.mkv"));
        assert!(!has_season_marker("Show - 07.mkv"));
        assert!(!has_season_marker("Samurai Show - 07.mkv"));
    }
}
