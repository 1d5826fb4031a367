use std::path::{Component, Path, PathBuf};

use dirs_next::home_dir;

/// Expands a leading `~` to the current user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    let p = path.trim();
    if p == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = p.strip_prefix("~/") {
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    if let Some(rest) = p.strip_prefix("~\\") {
        // Windows-style
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    PathBuf::from(p)
}

/// Collapses `.` and `..` components without touching the filesystem.
///
/// `..` never climbs above the first component, so `a/../../b` becomes `b`.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(normalized.components().next_back(), Some(Component::RootDir | Component::Prefix(_)) | None) {
                    normalized.pop();
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Resolves `candidate` against `root` and returns it when it stays inside `root`.
///
/// Relative candidates are joined onto `root`; absolute candidates are kept.
/// Both sides are normalized lexically before comparison.
pub fn is_within_root(candidate: &Path, root: &Path) -> Option<PathBuf> {
    let root = normalize_lexically(root);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let resolved = normalize_lexically(&joined);
    resolved.starts_with(&root).then_some(resolved)
}
