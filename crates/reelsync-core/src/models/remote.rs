use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of a remote listing.
///
/// `path` is the full remote path and doubles as the entry's remote identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    pub is_dir: bool,
}

impl RemoteEntry {
    /// Build an entry, deriving `name` from the last path component.
    pub fn new(path: impl Into<String>, size: u64, modified_time: DateTime<Utc>, is_dir: bool) -> Self {
        let path = normalize_remote_path(&path.into());
        let name = basename(&path).to_string();
        Self {
            path,
            name,
            size,
            modified_time,
            is_dir,
        }
    }

    pub fn file(path: impl Into<String>, size: u64, modified_time: DateTime<Utc>) -> Self {
        Self::new(path, size, modified_time, false)
    }

    pub fn dir(path: impl Into<String>, modified_time: DateTime<Utc>) -> Self {
        Self::new(path, 0, modified_time, true)
    }

    pub fn remote_identity(&self) -> &str {
        &self.path
    }

    /// Directory components between `root` and the entry itself.
    pub fn parent_components<'a>(&'a self, root: &str) -> Vec<&'a str> {
        let relative = relative_to(&self.path, root);
        let mut parts: Vec<&str> = relative.split('/').filter(|p| !p.is_empty()).collect();
        parts.pop();
        parts
    }
}

/// Collapse duplicate separators and drop a trailing `/`.
pub fn normalize_remote_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_was_sep = false;
    for c in path.chars() {
        if c == '/' {
            if !last_was_sep {
                out.push(c);
            }
            last_was_sep = true;
        } else {
            out.push(c);
            last_was_sep = false;
        }
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `path` with the `root` prefix removed, without a leading separator.
pub fn relative_to<'a>(path: &'a str, root: &str) -> &'a str {
    let root = root.trim_end_matches('/');
    path.strip_prefix(root)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(path)
        .trim_start_matches('/')
}
