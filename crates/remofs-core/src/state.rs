//! FileSystemState - immutable snapshot of one path
//!
//! Answers `Exists`/`Search` queries and decides whether a detected change
//! is semantically new. A state is never mutated in place; a fresh
//! observation replaces it.

use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::hasher;
use crate::path::{is_confined, resolve};

/// What a path points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Missing,
}

/// Snapshot of a single path under the served root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemState {
    /// Relative, slash-normalized; `""` is the root
    pub path: String,
    pub kind: EntryKind,
    /// Bytes, files only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Milliseconds since the unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_ms: Option<u64>,
    /// BLAKE3 of the content, files only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl FileSystemState {
    pub fn missing(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Missing,
            size: None,
            modified_ms: None,
            fingerprint: None,
        }
    }

    pub fn from_metadata(path: impl Into<String>, meta: &Metadata) -> Self {
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);

        if meta.is_dir() {
            Self {
                path: path.into(),
                kind: EntryKind::Directory,
                size: None,
                modified_ms,
                fingerprint: None,
            }
        } else {
            Self {
                path: path.into(),
                kind: EntryKind::File,
                size: Some(meta.len()),
                modified_ms,
                fingerprint: None,
            }
        }
    }

    /// Stat `rel` under `root`. Anything that cannot be stat'ed, or that a
    /// symlink resolves outside the root, is `Missing`.
    pub fn observe(root: &Path, rel: &str) -> Self {
        let full = resolve(root, rel);
        if !is_confined(root, &full) {
            return Self::missing(rel);
        }
        match std::fs::metadata(&full) {
            Ok(meta) => Self::from_metadata(rel, &meta),
            Err(_) => Self::missing(rel),
        }
    }

    /// Same as [`observe`](Self::observe), plus a content fingerprint for files
    pub fn observe_with_fingerprint(root: &Path, rel: &str) -> Self {
        Self::observe(root, rel).with_fingerprint(root)
    }

    /// Attach the content fingerprint. Unreadable files keep `None`.
    pub fn with_fingerprint(mut self, root: &Path) -> Self {
        if self.kind == EntryKind::File {
            self.fingerprint = hasher::fingerprint_file(resolve(root, &self.path)).ok();
        }
        self
    }

    pub fn exists(&self) -> bool {
        self.kind != EntryKind::Missing
    }

    /// Semantic equality used to drop no-op change events.
    ///
    /// Directories compare by kind only. Files compare by size and
    /// fingerprint; modification time counts only when a fingerprint is
    /// unavailable on either side.
    pub fn is_same_as(&self, other: &Self) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match self.kind {
            EntryKind::Missing | EntryKind::Directory => true,
            EntryKind::File => {
                self.size == other.size
                    && match (&self.fingerprint, &other.fingerprint) {
                        (Some(a), Some(b)) => a == b,
                        _ => self.modified_ms == other.modified_ms,
                    }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_observe_kinds() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();

        let file = FileSystemState::observe(dir.path(), "a.txt");
        assert_eq!(file.kind, EntryKind::File);
        assert_eq!(file.size, Some(5));

        let folder = FileSystemState::observe(dir.path(), "src");
        assert_eq!(folder.kind, EntryKind::Directory);
        assert_eq!(folder.size, None);

        let gone = FileSystemState::observe(dir.path(), "missing.txt");
        assert_eq!(gone.kind, EntryKind::Missing);
        assert!(gone.size.is_none() && gone.fingerprint.is_none());
    }

    #[test]
    fn test_touch_is_not_a_change() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let before = FileSystemState::observe_with_fingerprint(dir.path(), "a.txt");

        let mut touched = before.clone();
        touched.modified_ms = before.modified_ms.map(|m| m + 5_000);
        assert!(before.is_same_as(&touched));

        fs::write(dir.path().join("a.txt"), "jello").unwrap();
        let after = FileSystemState::observe_with_fingerprint(dir.path(), "a.txt");
        assert!(!before.is_same_as(&after));
    }

    #[test]
    fn test_mtime_decides_only_without_fingerprint() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let before = FileSystemState::observe(dir.path(), "a.txt");
        assert!(before.fingerprint.is_none());

        let mut touched = before.clone();
        touched.modified_ms = before.modified_ms.map(|m| m + 5_000);
        assert!(!before.is_same_as(&touched));
        assert!(before.is_same_as(&before.clone()));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_out_of_root_is_missing() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), "nope").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("leak.txt")).unwrap();

        let state = FileSystemState::observe(dir.path(), "leak.txt");
        assert_eq!(state.kind, EntryKind::Missing);
        assert_eq!(state.path, "leak.txt");
    }

    #[test]
    fn test_missing_serializes_without_size() {
        let json = serde_json::to_string(&FileSystemState::missing("x")).unwrap();
        assert_eq!(json, r#"{"path":"x","kind":"missing"}"#);
    }
}
