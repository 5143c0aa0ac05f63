//! Process spawning helpers shared across the workspace.
//!
//! Every external tool the engine drives (curl, wget, ffmpeg, `cat`/`copy`)
//! is launched through the platform shell so that command lines stay plain
//! strings with interpolated paths.

use std::ffi::{OsStr, OsString};
use std::path::Path;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Shell program used to interpret command lines.
#[cfg(windows)]
pub const SHELL: &str = "cmd.exe";
#[cfg(not(windows))]
pub const SHELL: &str = "/bin/bash";

/// Flag passing the command line to [`SHELL`].
#[cfg(windows)]
pub const SHELL_FLAG: &str = "/C";
#[cfg(not(windows))]
pub const SHELL_FLAG: &str = "-c";

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Build a `PATH` value with `extra` placed in front of the inherited one.
///
/// Returns `None` when the joined value cannot be represented (a component
/// containing the platform path separator).
pub fn augmented_path(extra: &Path) -> Option<OsString> {
    let mut paths = vec![extra.to_path_buf()];
    if let Some(current) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&current));
    }
    std::env::join_paths(paths).ok()
}

/// Quote a value for interpolation into a shell command line.
pub fn quote_arg(value: impl AsRef<OsStr>) -> String {
    let value = value.as_ref().to_string_lossy();
    #[cfg(windows)]
    {
        format!("\"{}\"", value.replace('"', "\"\""))
    }
    #[cfg(not(windows))]
    {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Create a `tokio::process::Command` running `command_line` through the shell.
#[cfg(feature = "tokio")]
pub fn tokio_shell_command(command_line: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(SHELL);
    cmd.arg(SHELL_FLAG).arg(command_line);
    cmd.no_window();
    cmd
}
