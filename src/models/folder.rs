//! Represents one "directory" level of the bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A folder in the mirror, derived from the slash-delimited object keys.
///
/// Folders form a tree through `parent_id`. The parent's `path` is always a
/// strict prefix of the child's `path`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Folder {
    pub id: i64,

    /// Full slash-delimited path without leading or trailing `/` (e.g. `a/b`).
    pub path: String,

    /// Last path segment.
    pub name: String,

    /// Parent folder, `None` for top-level folders.
    pub parent_id: Option<i64>,

    /// Photos directly inside this folder (recomputed per reconciliation).
    pub photo_count: i64,

    /// Direct child folders (recomputed per reconciliation).
    pub subfolder_count: i64,

    /// Last reconciliation pass that touched this folder.
    pub last_synced: Option<DateTime<Utc>>,

    /// Last UI access. Written by the API layer only.
    pub last_visited: Option<DateTime<Utc>>,
}

/// Split an object key into its folder path and filename.
///
/// `a/b/photo.jpg` → (`a/b`, `photo.jpg`), `photo.jpg` → (``, `photo.jpg`).
pub fn split_key(key: &str) -> (&str, &str) {
    match key.rfind('/') {
        Some(pos) => (&key[..pos], &key[pos + 1..]),
        None => ("", key),
    }
}

/// Every ancestor path of `path`, shallow first, including `path` itself.
///
/// `a/b/c` → [`a`, `a/b`, `a/b/c`]. Empty segments are skipped.
pub fn folder_chain(path: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);
        chain.push(current.clone());
    }
    chain
}

/// Trim surrounding `/` from a scope. An empty scope means the whole bucket.
pub fn normalize_scope(scope: &str) -> Option<String> {
    let trimmed = scope.trim_matches('/');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Key prefix selecting every object under `scope` (`a/b` → `a/b/`).
///
/// Matched with `substr(s3_key, 1, length(prefix)) = prefix` rather than
/// `LIKE`, so `_` and `%` in keys are literal.
pub fn scope_prefix(scope: Option<&str>) -> String {
    match scope.and_then(normalize_scope) {
        Some(scope) => format!("{}/", scope),
        None => String::new(),
    }
}
