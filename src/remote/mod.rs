//! Remote command execution over SSH.
//!
//! The readiness checker talks to servers through the [`SshTransport`] and
//! [`SshSession`] traits. [`ProcessSshTransport`] implements them with the
//! system `ssh` client driven through a [`CommandRunner`], so tests can script
//! every invocation without spawning processes.

use std::env;
use std::ffi::OsString;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::debug;

mod types;
mod util;

pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner, RemoteCommandOutput};
pub use util::{expand_tilde, render_command_line};

/// Default `ssh` binary.
pub const DEFAULT_SSH_BIN: &str = "ssh";

/// Exit code the OpenSSH client reserves for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

/// Errors raised while running commands locally or over SSH.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the SSH connection cannot be established or is lost.
    #[error("ssh connection to {host} failed: {message}")]
    Connect {
        /// Host that could not be reached.
        host: String,
        /// Client supplied reason.
        message: String,
    },
}

/// Where and as whom to connect.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Remote login.
    pub user: String,
    /// Private key used for authentication.
    pub identity_file: Utf8PathBuf,
}

impl SshTarget {
    /// `user@host` destination argument.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// An open SSH session able to run commands.
pub trait SshSession {
    /// Runs `command` on the remote host.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the command cannot be delivered. A
    /// non-zero remote exit code is not an error.
    fn exec(&mut self, command: &str) -> Result<RemoteCommandOutput, RemoteError>;
}

/// Opens SSH sessions. Implementations must be callable from many workers.
pub trait SshTransport: Send + Sync {
    /// Connects to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Connect`] when the host refuses or cannot be
    /// reached, or [`RemoteError::Spawn`] when the client cannot start.
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn SshSession + '_>, RemoteError>;
}

/// Seconds an idle control master outlives its last client.
const CONTROL_PERSIST_SECS: u64 = 60;

/// [`SshTransport`] backed by the system `ssh` client.
///
/// Each [`SshTransport::connect`] starts an OpenSSH control master on a fresh
/// control socket, and every command of the session is multiplexed over that
/// one TCP connection. Dropping the session tells the master to exit.
/// Batch mode is on and host key checking is off, since lab hosts are freshly
/// created and short-lived.
#[derive(Clone, Debug)]
pub struct ProcessSshTransport<R: CommandRunner> {
    ssh_bin: String,
    connect_timeout_secs: u64,
    control_dir: Utf8PathBuf,
    next_control: Arc<AtomicU64>,
    runner: R,
}

fn default_control_dir() -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(env::temp_dir()).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

impl ProcessSshTransport<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(ssh_bin: impl Into<String>) -> Self {
        Self::new(ssh_bin, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> ProcessSshTransport<R> {
    /// Creates a transport invoking `ssh_bin` through `runner`.
    #[must_use]
    pub fn new(ssh_bin: impl Into<String>, runner: R) -> Self {
        Self {
            ssh_bin: ssh_bin.into(),
            connect_timeout_secs: 10,
            control_dir: default_control_dir(),
            next_control: Arc::default(),
            runner,
        }
    }

    /// Overrides the `ConnectTimeout` passed to `ssh`.
    #[must_use]
    pub const fn with_connect_timeout(mut self, seconds: u64) -> Self {
        self.connect_timeout_secs = seconds;
        self
    }

    /// Places control sockets under `dir` instead of the system temp
    /// directory. Socket paths must stay short.
    #[must_use]
    pub fn with_control_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.control_dir = dir.into();
        self
    }

    fn allocate_control_path(&self) -> Utf8PathBuf {
        let serial = self.next_control.fetch_add(1, Ordering::Relaxed);
        self.control_dir
            .join(format!("labrat-{}-{serial}", process::id()))
    }

    fn build_ssh_args(
        &self,
        target: &SshTarget,
        control_path: &Utf8Path,
        remote_command: &str,
    ) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(target.port.to_string()),
            OsString::from("-i"),
            OsString::from(expand_tilde(target.identity_file.as_str())),
        ];
        for option in [
            String::from("BatchMode=yes"),
            String::from("StrictHostKeyChecking=no"),
            String::from("UserKnownHostsFile=/dev/null"),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            String::from("ControlMaster=auto"),
            format!("ControlPath={control_path}"),
            format!("ControlPersist={CONTROL_PERSIST_SECS}s"),
        ] {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args.push(OsString::from(target.destination()));
        args.push(OsString::from(remote_command));
        args
    }

    fn execute(
        &self,
        target: &SshTarget,
        control_path: &Utf8Path,
        command: &str,
    ) -> Result<RemoteCommandOutput, RemoteError> {
        let args = self.build_ssh_args(target, control_path, command);
        debug!(
            host = %target.host,
            command = %render_command_line(&self.ssh_bin, &args),
            "running remote command"
        );
        let output = self.runner.run(&self.ssh_bin, &args)?;
        if output.code == Some(SSH_CLIENT_FAILURE) {
            return Err(RemoteError::Connect {
                host: target.host.clone(),
                message: output.stderr.trim().to_owned(),
            });
        }
        Ok(RemoteCommandOutput {
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn close_master(&self, target: &SshTarget, control_path: &Utf8Path) {
        let args = [
            OsString::from("-o"),
            OsString::from(format!("ControlPath={control_path}")),
            OsString::from("-O"),
            OsString::from("exit"),
            OsString::from(target.destination()),
        ];
        if let Err(err) = self.runner.run(&self.ssh_bin, &args) {
            debug!(host = %target.host, error = %err, "failed to stop ssh control master");
        }
    }
}

impl<R: CommandRunner> SshTransport for ProcessSshTransport<R> {
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn SshSession + '_>, RemoteError> {
        let control_path = self.allocate_control_path();
        let handshake = self.execute(target, &control_path, "true")?;
        if handshake.exit_code != Some(0) {
            return Err(RemoteError::Connect {
                host: target.host.clone(),
                message: format!(
                    "connection check exited with status {}",
                    handshake
                        .exit_code
                        .map_or_else(|| String::from("unknown"), |code| code.to_string())
                ),
            });
        }
        Ok(Box::new(ProcessSshSession {
            transport: self,
            target: target.clone(),
            control_path,
        }))
    }
}

struct ProcessSshSession<'a, R: CommandRunner> {
    transport: &'a ProcessSshTransport<R>,
    target: SshTarget,
    control_path: Utf8PathBuf,
}

impl<R: CommandRunner> SshSession for ProcessSshSession<'_, R> {
    fn exec(&mut self, command: &str) -> Result<RemoteCommandOutput, RemoteError> {
        self.transport
            .execute(&self.target, &self.control_path, command)
    }
}

impl<R: CommandRunner> Drop for ProcessSshSession<'_, R> {
    fn drop(&mut self) {
        self.transport.close_master(&self.target, &self.control_path);
    }
}
