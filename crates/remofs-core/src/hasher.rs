//! Content Fingerprints - BLAKE3
//!
//! Features:
//! - Streaming file hashing (no full read into memory)
//! - Parallel subtree snapshots with Rayon
//! - Unreadable entries are skipped, never fatal

use rayon::prelude::*;
use std::fs::File;
use std::io;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use crate::path::{is_confined, relative_to, resolve};
use crate::state::FileSystemState;

/// Hash a single file using BLAKE3
pub fn fingerprint_file(path: impl AsRef<Path>) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(File::open(path.as_ref())?)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Snapshot every entry below `rel` (excluding `rel` itself), fingerprints included.
///
/// Directory listing is sequential; hashing runs on the Rayon pool.
pub fn snapshot_tree(root: &Path, rel: &str) -> Vec<FileSystemState> {
    let base = resolve(root, rel);
    let entries: Vec<(String, std::fs::Metadata)> = WalkDir::new(&base)
        .min_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| !e.path_is_symlink() || is_confined(root, e.path()))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Snapshot skipped entry: {}", e);
                None
            }
        })
        .filter_map(|entry| {
            let rel = relative_to(root, entry.path())?;
            let meta = entry.metadata().ok()?;
            Some((rel, meta))
        })
        .collect();

    entries
        .par_iter()
        .map(|(rel, meta)| FileSystemState::from_metadata(rel.as_str(), meta).with_fingerprint(root))
        .collect()
}
