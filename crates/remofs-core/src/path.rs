//! Wire Paths - relative, slash-normalized
//!
//! Every path that crosses the wire is relative to the served root and uses
//! `/` as separator. The root itself is the empty string.

use std::path::{Component, Path, PathBuf};

/// Normalize a client-supplied path.
///
/// Backslashes become `/`, `.` and empty segments are dropped and a leading
/// `/` is ignored. Returns `None` when any segment is `..`, since such a
/// path could resolve outside the root.
pub fn normalize(raw: &str) -> Option<String> {
    let cleaned = clean(raw);
    if cleaned.split('/').any(|segment| segment == "..") {
        return None;
    }
    Some(cleaned)
}

/// Slash-normalize without rejecting `..`. Only for echoing a path back.
pub fn clean(raw: &str) -> String {
    raw.split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a normalized relative path onto the root
pub fn resolve(root: &Path, rel: &str) -> PathBuf {
    let mut full = root.to_path_buf();
    for segment in rel.split('/').filter(|s| !s.is_empty()) {
        full.push(segment);
    }
    full
}

/// Express an absolute path relative to root, or `None` when it lies outside
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let rest = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rest.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// True when `full`, with symlinks resolved, stays under `root`.
///
/// Paths that do not resolve (missing, dangling link) count as confined;
/// they observe as missing anyway.
pub fn is_confined(root: &Path, full: &Path) -> bool {
    let Ok(real) = full.canonicalize() else {
        return true;
    };
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    real.starts_with(root)
}

/// `path` itself followed by each of its ancestors, ending with the root (`""`)
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(path);
    std::iter::from_fn(move || {
        let current = next?;
        next = if current.is_empty() {
            None
        } else {
            Some(current.rfind('/').map_or("", |idx| &current[..idx]))
        };
        Some(current)
    })
}

/// True when `path` is `ancestor` or lies below it
pub fn is_within(ancestor: &str, path: &str) -> bool {
    ancestor.is_empty()
        || path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}
