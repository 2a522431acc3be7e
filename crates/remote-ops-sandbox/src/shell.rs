//! Platform shell selection for `run-command`.

use std::path::{Path, PathBuf};

/// Returns `(shell_program, shell_arg)` for running a command string.
///
/// - Windows: `("cmd", "/C")`
/// - Unix-like: the user's `$SHELL` if it points at a real file, otherwise
///   `/bin/sh`, with `-c`
#[must_use]
pub fn get_shell_command() -> (String, &'static str) {
    if cfg!(windows) {
        ("cmd".into(), "/C")
    } else {
        (
            current_unix_shell().to_string_lossy().into_owned(),
            "-c",
        )
    }
}

fn current_unix_shell() -> PathBuf {
    if let Ok(shell) = std::env::var("SHELL") {
        let path = Path::new(&shell);
        if path.is_absolute() && path.is_file() {
            return path.to_path_buf();
        }
    }
    PathBuf::from("/bin/sh")
}
