//! Local process execution and captured command output.

use std::ffi::OsString;
use std::process::{Command, Stdio};

use super::RemoteError;

/// What a local program left behind once it exited.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit status; `None` when a signal ended the process.
    pub code: Option<i32>,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

impl CommandOutput {
    /// `true` only for exit status 0.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Exit status rendered for error messages, `unknown` without one.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Seam between key and SSH helpers and the programs they launch.
pub trait CommandRunner: Send + Sync {
    /// Launches `program` with `args` and waits for it, capturing both
    /// output streams. Stdin is closed.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Spawn`] when the program cannot be launched.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RemoteError>;
}

/// [`CommandRunner`] backed by [`std::process::Command`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RemoteError> {
        let spawn_failed = |err: std::io::Error| RemoteError::Spawn {
            program: program.to_owned(),
            message: err.to_string(),
        };
        let finished = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(spawn_failed)?;
        Ok(CommandOutput {
            code: finished.status.code(),
            stdout: String::from_utf8_lossy(&finished.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&finished.stderr).into_owned(),
        })
    }
}

/// Result of one command run over an SSH session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommandOutput {
    /// Remote exit status, when the session reported one.
    pub exit_code: Option<i32>,
    /// Remote standard output.
    pub stdout: String,
    /// Remote standard error.
    pub stderr: String,
}

impl RemoteCommandOutput {
    /// Standard output without leading or trailing whitespace.
    #[must_use]
    pub fn trimmed_stdout(&self) -> &str {
        self.stdout.trim()
    }
}
