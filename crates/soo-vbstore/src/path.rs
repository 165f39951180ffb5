//! Path utilities for the store.
//!
//! Store paths are absolute, `/`-separated and made of plain segments: no
//! `.` or `..`, no empty segments once redundant slashes are dropped.

use crate::error::VbsError;

/// Validate and normalize a path, dropping redundant and trailing slashes.
pub fn normalize_path(path: &str) -> Result<String, VbsError> {
    if path.is_empty() {
        return Err(VbsError::invalid_path("empty path"));
    }
    if !path.starts_with('/') {
        return Err(VbsError::invalid_path(format!("{path}: must be absolute")));
    }
    if path.contains('\0') {
        return Err(VbsError::invalid_path("path contains null character"));
    }

    let mut result = String::with_capacity(path.len());
    for component in components(path) {
        if component == "." || component == ".." {
            return Err(VbsError::invalid_path(format!(
                "{path}: relative component {component:?}"
            )));
        }
        result.push('/');
        result.push_str(component);
    }
    if result.is_empty() {
        result.push('/');
    }
    Ok(result)
}

/// Non-empty segments of `path`, root first.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Parent path of a normalized path.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

/// Last segment of a normalized path; empty for the root.
pub fn filename(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Join a directory path and a child name.
pub fn join_path(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Check if `path` is `base` or lies under it.
pub fn is_under(path: &str, base: &str) -> bool {
    if base == "/" {
        return true;
    }
    path.starts_with(base) && (path.len() == base.len() || path.as_bytes()[base.len()] == b'/')
}
