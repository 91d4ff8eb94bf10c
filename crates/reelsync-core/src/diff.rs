//! Which remote entries are new since the last run.

use crate::config::FilterSettings;
use crate::models::RemoteEntry;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Why an entry was left out of a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    ExcludedExtension(String),
    ExcludedKeyword(String),
    /// Modified too recently; it may still be being written upstream.
    TooRecent,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::ExcludedExtension(ext) => write!(f, "excluded extension '{}'", ext),
            Rejection::ExcludedKeyword(kw) => write!(f, "excluded keyword '{}'", kw),
            Rejection::TooRecent => f.write_str("modified too recently"),
        }
    }
}

/// Exclusion rules applied to remote entries before diffing.
#[derive(Debug, Clone)]
pub struct EntryFilter {
    remote_root: String,
    excluded_extensions: HashSet<String>,
    excluded_keywords: Vec<String>,
    min_age: Duration,
}

impl EntryFilter {
    pub fn from_settings(settings: &FilterSettings) -> Self {
        Self {
            remote_root: "/".to_string(),
            excluded_extensions: settings
                .excluded_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            excluded_keywords: settings
                .excluded_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            min_age: Duration::from_secs(settings.min_age_secs),
        }
    }

    /// Accepts everything.
    pub fn permissive() -> Self {
        Self {
            remote_root: "/".to_string(),
            excluded_extensions: HashSet::new(),
            excluded_keywords: Vec::new(),
            min_age: Duration::ZERO,
        }
    }

    /// Only directories below this root are checked for excluded keywords.
    pub fn with_remote_root(mut self, remote_root: impl Into<String>) -> Self {
        self.remote_root = remote_root.into();
        self
    }

    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    pub fn rejection(&self, entry: &RemoteEntry, now: DateTime<Utc>) -> Option<Rejection> {
        if !entry.is_dir {
            if let Some(ext) = Path::new(&entry.name).extension().and_then(|e| e.to_str()) {
                let ext = ext.to_lowercase();
                if self.excluded_extensions.contains(&ext) {
                    return Some(Rejection::ExcludedExtension(ext));
                }
            }
        }

        let name = entry.name.to_lowercase();
        let ancestors = entry.parent_components(&self.remote_root);
        for keyword in &self.excluded_keywords {
            let in_ancestor = ancestors.iter().any(|dir| dir.to_lowercase().contains(keyword));
            if name.contains(keyword) || in_ancestor {
                return Some(Rejection::ExcludedKeyword(keyword.clone()));
            }
        }

        // Only files age. A modification time in the future counts as too
        // recent.
        if !entry.is_dir {
            let too_recent = match now.signed_duration_since(entry.modified_time).to_std() {
                Ok(age) => age < self.min_age,
                Err(_) => !self.min_age.is_zero(),
            };
            if too_recent {
                return Some(Rejection::TooRecent);
            }
        }

        None
    }

    pub fn accepts(&self, entry: &RemoteEntry, now: DateTime<Utc>) -> bool {
        self.rejection(entry, now).is_none()
    }
}

/// Result of one diff.
#[derive(Debug, Clone, Default)]
pub struct DiffOutcome {
    /// Entries not yet known, sorted by remote path.
    pub new_entries: Vec<RemoteEntry>,
    /// Entries in the listing, duplicates included.
    pub listed: usize,
    pub duplicates: usize,
    pub directories: usize,
    pub filtered: usize,
    pub already_known: usize,
}

/// Computes the set difference between a remote listing and known identities.
#[derive(Debug, Clone)]
pub struct DiffEngine {
    filter: EntryFilter,
    include_directories: bool,
}

impl DiffEngine {
    pub fn new(filter: EntryFilter, include_directories: bool) -> Self {
        Self {
            filter,
            include_directories,
        }
    }

    pub fn from_settings(settings: &FilterSettings, remote_root: &str) -> Self {
        Self::new(
            EntryFilter::from_settings(settings).with_remote_root(remote_root),
            settings.include_directories,
        )
    }

    pub fn filter(&self) -> &EntryFilter {
        &self.filter
    }

    pub fn diff(
        &self,
        listing: impl IntoIterator<Item = RemoteEntry>,
        known: &HashSet<String>,
    ) -> DiffOutcome {
        self.diff_at(listing, known, Utc::now())
    }

    /// Diff against `known` using `now` as the reference time for age checks.
    ///
    /// Duplicate paths collapse to the last one seen. Running again with the
    /// returned entries added to `known` yields nothing.
    pub fn diff_at(
        &self,
        listing: impl IntoIterator<Item = RemoteEntry>,
        known: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> DiffOutcome {
        let mut outcome = DiffOutcome::default();
        let mut unique: BTreeMap<String, RemoteEntry> = BTreeMap::new();

        for entry in listing {
            outcome.listed += 1;
            if unique.insert(entry.path.clone(), entry).is_some() {
                outcome.duplicates += 1;
            }
        }

        for (path, entry) in unique {
            if entry.is_dir && !self.include_directories {
                outcome.directories += 1;
                continue;
            }
            if let Some(reason) = self.filter.rejection(&entry, now) {
                tracing::trace!("Skipping {}: {}", path, reason);
                outcome.filtered += 1;
                continue;
            }
            if known.contains(&path) {
                outcome.already_known += 1;
                continue;
            }
            outcome.new_entries.push(entry);
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap()
    }

    fn old(path: &str) -> RemoteEntry {
        RemoteEntry::file(path, 100, now() - chrono::Duration::hours(1))
    }

    fn engine() -> DiffEngine {
        DiffEngine::from_settings(&FilterSettings::default(), "/tv")
    }

    #[test]
    fn test_diff_is_idempotent() {
        let listing = vec![old("/tv/b.mkv"), old("/tv/a.mkv"), old("/tv/Show/c.mkv")];
        let mut known = HashSet::new();

        let first = engine().diff_at(listing.clone(), &known, now());
        let paths: Vec<&str> = first.new_entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/tv/Show/c.mkv", "/tv/a.mkv", "/tv/b.mkv"]);

        known.extend(first.new_entries.iter().map(|e| e.path.clone()));
        let second = engine().diff_at(listing, &known, now());
        assert!(second.new_entries.is_empty());
        assert_eq!(second.already_known, 3);
    }

    #[test]
    fn test_duplicates_collapse_last_seen_wins() {
        let mut later = old("/tv/a.mkv");
        later.size = 999;
        let listing = vec![old("/tv/a.mkv"), later];

        let outcome = engine().diff_at(listing, &HashSet::new(), now());
        assert_eq!(outcome.new_entries.len(), 1);
        assert_eq!(outcome.new_entries[0].size, 999);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.listed, 2);
    }

    #[test]
    fn test_directories_only_when_requested() {
        let listing = vec![
            RemoteEntry::dir("/tv/Show", now() - chrono::Duration::hours(1)),
            old("/tv/Show/a.mkv"),
        ];

        let outcome = engine().diff_at(listing.clone(), &HashSet::new(), now());
        assert_eq!(outcome.new_entries.len(), 1);
        assert_eq!(outcome.directories, 1);

        let settings = FilterSettings {
            include_directories: true,
            ..Default::default()
        };
        let with_dirs = DiffEngine::from_settings(&settings, "/tv");
        assert_eq!(with_dirs.diff_at(listing, &HashSet::new(), now()).new_entries.len(), 2);
    }

    #[test]
    fn test_fresh_directory_is_not_too_recent() {
        let filter = EntryFilter::from_settings(&FilterSettings::default()).with_remote_root("/tv");
        let just_created = RemoteEntry::dir("/tv/New Show", now());
        assert!(filter.accepts(&just_created, now()));

        let sample_dir = RemoteEntry::dir("/tv/Show/Sample", now());
        assert_eq!(
            filter.rejection(&sample_dir, now()),
            Some(Rejection::ExcludedKeyword("sample".to_string()))
        );
    }

    #[test]
    fn test_filters() {
        let filter = EntryFilter::from_settings(&FilterSettings::default()).with_remote_root("/tv");

        assert_eq!(
            filter.rejection(&old("/tv/Show/poster.JPG"), now()),
            Some(Rejection::ExcludedExtension("jpg".to_string()))
        );
        assert_eq!(
            filter.rejection(&old("/tv/Show/show-sample.mkv"), now()),
            Some(Rejection::ExcludedKeyword("sample".to_string()))
        );
        assert_eq!(
            filter.rejection(&old("/tv/Show/Screens/ep01.mkv"), now()),
            Some(Rejection::ExcludedKeyword("screens".to_string()))
        );

        let fresh = RemoteEntry::file("/tv/Show/new.mkv", 1, now() - chrono::Duration::seconds(10));
        assert_eq!(filter.rejection(&fresh, now()), Some(Rejection::TooRecent));

        assert!(filter.accepts(&old("/tv/Show/ep01.mkv"), now()));
    }

    #[test]
    fn test_keywords_above_root_are_ignored() {
        let filter = EntryFilter::from_settings(&FilterSettings::default())
            .with_remote_root("/samples/tv");
        assert!(filter.accepts(&old("/samples/tv/Show/ep01.mkv"), now()));
    }

    #[test]
    fn test_permissive_filter() {
        let engine = DiffEngine::new(EntryFilter::permissive(), false);
        let listing = vec![
            RemoteEntry::file("/x/sample.jpg", 1, now()),
            RemoteEntry::file("/x/ep.mkv", 1, now()),
        ];
        assert_eq!(engine.diff_at(listing, &HashSet::new(), now()).new_entries.len(), 2);
    }
}
