//! Directory Searcher - bounded recursive listing
//!
//! Depth counts from the search root: the root is depth 0, its direct
//! children depth 1. A non-positive depth means unlimited. Results come back
//! in lexicographic path order.

use glob::Pattern;
use std::path::PathBuf;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{RemoteFsError, Result};
use crate::path::{is_confined, normalize, relative_to, resolve};
use crate::state::FileSystemState;

/// Searcher bound to the served root
#[derive(Debug, Clone)]
pub struct DirectorySearcher {
    root: PathBuf,
    max_depth: i64,
}

impl DirectorySearcher {
    /// `max_depth <= 0` leaves the request's depth unbounded
    pub fn new(root: impl Into<PathBuf>, max_depth: i64) -> Self {
        Self {
            root: root.into(),
            max_depth,
        }
    }

    /// Clamp the requested depth. `None` means unlimited.
    pub fn effective_depth(&self, requested: i64) -> Option<usize> {
        let depth = if self.max_depth > 0 {
            if requested <= 0 || requested > self.max_depth {
                self.max_depth
            } else {
                requested
            }
        } else {
            requested
        };
        (depth > 0).then_some(depth as usize)
    }

    /// Walk `rel_root`, returning every entry whose file name matches `pattern`
    pub fn search(&self, rel_root: &str, pattern: &str, depth: i64) -> Result<Vec<FileSystemState>> {
        let rel_root = normalize(rel_root).ok_or_else(|| RemoteFsError::NotFound(rel_root.to_string()))?;
        let base = resolve(&self.root, &rel_root);
        if !base.is_dir() {
            return Err(RemoteFsError::NotFound(rel_root));
        }

        let matcher = match pattern {
            "" | "*" => None,
            p => Some(Pattern::new(p).map_err(|e| RemoteFsError::Failed(format!("invalid pattern {p:?}: {e}")))?),
        };

        let mut walker = WalkDir::new(&base).min_depth(1).follow_links(true);
        if let Some(depth) = self.effective_depth(depth) {
            walker = walker.max_depth(depth);
        }

        let mut results = Vec::new();
        let entries = walker
            .into_iter()
            .filter_entry(|e| !e.path_is_symlink() || is_confined(&self.root, e.path()));
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if e.loop_ancestor().is_some() {
                        debug!("Search skipped symlink cycle: {}", e);
                    } else {
                        warn!("Search skipped entry: {}", e);
                    }
                    continue;
                }
            };

            if let Some(matcher) = &matcher {
                if !matcher.matches(&entry.file_name().to_string_lossy()) {
                    continue;
                }
            }

            let Some(rel) = relative_to(&self.root, entry.path()) else {
                continue;
            };
            match entry.metadata() {
                Ok(meta) => results.push(FileSystemState::from_metadata(rel, &meta)),
                Err(e) => warn!("Search skipped {}: {}", rel, e),
            }
        }

        results.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(results)
    }
}
