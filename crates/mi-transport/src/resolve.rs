//! Locating debugger and proxy executables.

use std::{
    collections::HashSet,
    env::{join_paths, split_paths},
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

/// Expand a leading `~` to the user's home directory.
#[must_use]
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Resolve an executable to an absolute path.
///
/// The search order is:
/// 1. Explicit paths (absolute or containing a separator), after `~` expansion.
/// 2. The current process PATH via `which`.
pub async fn resolve_executable_path(executable: &Path) -> Option<PathBuf> {
    if executable.as_os_str().is_empty() {
        return None;
    }

    let expanded = expand_tilde(executable);
    if expanded.components().count() > 1 || expanded.is_absolute() {
        return expanded.is_file().then_some(expanded);
    }

    which_async(expanded).await
}

/// Merge two PATH strings into a single, de-duplicated PATH.
#[must_use]
pub fn merge_paths(primary: impl AsRef<OsStr>, secondary: impl AsRef<OsStr>) -> OsString {
    let mut seen = HashSet::<PathBuf>::new();
    let mut merged = Vec::<PathBuf>::new();

    for p in split_paths(primary.as_ref()).chain(split_paths(secondary.as_ref())) {
        if !p.as_os_str().is_empty() && seen.insert(p.clone()) {
            merged.push(p);
        }
    }

    join_paths(merged).unwrap_or_default()
}

async fn which_async(executable: PathBuf) -> Option<PathBuf> {
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}
