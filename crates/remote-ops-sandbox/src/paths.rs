//! Path confinement for sandboxed file access.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Sandbox confinement error.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("access to path \"{0}\" is outside the project directory")]
    OutsideRoot(String),
}

/// Resolve `raw` against `root`, rejecting any form that escapes the root.
///
/// The check is normalize-then-contains: the candidate is normalized
/// component-wise (`.` and `..` resolved lexically, since the target may not
/// exist yet) and must then sit inside the normalized root. Windows-drive
/// paths (`C:\x`) are treated as absolute on every platform so they cannot
/// pass as odd relative file names.
///
/// # Errors
/// Returns [`SandboxError::OutsideRoot`] if the resolved path leaves `root`.
pub fn resolve_within(root: &Path, raw: &str) -> Result<PathBuf, SandboxError> {
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() || has_drive_prefix(raw) {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let resolved = normalize(&joined);
    if resolved.starts_with(root) {
        Ok(resolved)
    } else {
        Err(SandboxError::OutsideRoot(raw.to_string()))
    }
}

/// Lexically normalize a path without touching the filesystem.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping past the root leaves the stray `..` in place so the
                // containment check fails downstream.
                if !out.pop() {
                    out.push(Component::ParentDir.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn has_drive_prefix(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}
