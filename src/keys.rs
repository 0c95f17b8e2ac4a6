//! Local admin key pairs.
//!
//! Each lab gets its own ed25519 key pair, generated with `ssh-keygen` into the
//! configured keys directory as `{lab}-admin` and `{lab}-admin.pub`. The public
//! half is uploaded to the backend and embedded in cloud-init user data; the
//! private half authenticates readiness checks.

use std::ffi::OsString;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use thiserror::Error;
use tracing::{debug, info};

use crate::remote::{CommandRunner, ProcessCommandRunner, RemoteError};

/// Default `ssh-keygen` binary.
pub const DEFAULT_SSH_KEYGEN_BIN: &str = "ssh-keygen";

/// Errors raised while managing local key pairs.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum KeyError {
    /// Raised when the keys directory cannot be created or opened.
    #[error("failed to prepare keys directory {path}: {message}")]
    Directory {
        /// Directory path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when `ssh-keygen` cannot be started.
    #[error(transparent)]
    Spawn(#[from] RemoteError),
    /// Raised when `ssh-keygen` exits unsuccessfully.
    #[error("ssh-keygen exited with status {status_text} for {name}: {stderr}")]
    Keygen {
        /// Key pair name.
        name: String,
        /// Human readable exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when a key file cannot be read or removed.
    #[error("failed to access key file {path}: {message}")]
    File {
        /// Key file path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

/// Storage for per-lab admin key pairs.
pub trait KeyStore: Send + Sync {
    /// Creates (or replaces) the key pair `name` and returns its public key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] when the pair cannot be generated or read back.
    fn create_key_pair(&self, name: &str) -> Result<String, KeyError>;

    /// Path of the private key for `name`.
    fn private_key_path(&self, name: &str) -> Utf8PathBuf;

    /// Removes both halves of the pair. Missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] when an existing file cannot be removed.
    fn delete_key_pair(&self, name: &str) -> Result<(), KeyError>;
}

/// [`KeyStore`] writing key files to a local directory with `ssh-keygen`.
#[derive(Clone, Debug)]
pub struct LocalKeyStore<R: CommandRunner> {
    keys_dir: Utf8PathBuf,
    keygen_bin: String,
    runner: R,
}

impl LocalKeyStore<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(keys_dir: impl Into<Utf8PathBuf>) -> Self {
        Self::new(keys_dir, DEFAULT_SSH_KEYGEN_BIN, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> LocalKeyStore<R> {
    /// Creates a key store rooted at `keys_dir`.
    #[must_use]
    pub fn new(keys_dir: impl Into<Utf8PathBuf>, keygen_bin: impl Into<String>, runner: R) -> Self {
        Self {
            keys_dir: keys_dir.into(),
            keygen_bin: keygen_bin.into(),
            runner,
        }
    }

    /// Directory holding the key files.
    #[must_use]
    pub fn keys_dir(&self) -> &Utf8Path {
        &self.keys_dir
    }

    fn open_dir(&self) -> Result<Dir, KeyError> {
        let directory_error = |err: io::Error| KeyError::Directory {
            path: self.keys_dir.clone(),
            message: err.to_string(),
        };
        Dir::create_ambient_dir_all(&self.keys_dir, ambient_authority()).map_err(directory_error)?;
        Dir::open_ambient_dir(&self.keys_dir, ambient_authority()).map_err(directory_error)
    }

    fn remove_if_present(&self, dir: &Dir, file: &str) -> Result<(), KeyError> {
        match dir.remove_file(file) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(KeyError::File {
                path: self.keys_dir.join(file),
                message: err.to_string(),
            }),
        }
    }
}

fn public_key_file(name: &str) -> String {
    format!("{name}.pub")
}

impl<R: CommandRunner> KeyStore for LocalKeyStore<R> {
    fn create_key_pair(&self, name: &str) -> Result<String, KeyError> {
        let dir = self.open_dir()?;
        // ssh-keygen prompts before overwriting, so clear stale files first.
        self.remove_if_present(&dir, name)?;
        self.remove_if_present(&dir, &public_key_file(name))?;

        let private_path = self.private_key_path(name);
        let args = [
            OsString::from("-q"),
            OsString::from("-t"),
            OsString::from("ed25519"),
            OsString::from("-N"),
            OsString::new(),
            OsString::from("-C"),
            OsString::from(name),
            OsString::from("-f"),
            OsString::from(private_path.as_str()),
        ];
        let output = self.runner.run(&self.keygen_bin, &args)?;
        if !output.is_success() {
            return Err(KeyError::Keygen {
                name: name.to_owned(),
                status_text: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            });
        }

        let public_file = public_key_file(name);
        let public_key = dir
            .read_to_string(&public_file)
            .map_err(|err| KeyError::File {
                path: self.keys_dir.join(&public_file),
                message: err.to_string(),
            })?;
        info!(key = name, path = %private_path, "generated admin key pair");
        Ok(public_key.trim().to_owned())
    }

    fn private_key_path(&self, name: &str) -> Utf8PathBuf {
        self.keys_dir.join(name)
    }

    fn delete_key_pair(&self, name: &str) -> Result<(), KeyError> {
        let dir = match Dir::open_ambient_dir(&self.keys_dir, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(KeyError::Directory {
                    path: self.keys_dir.clone(),
                    message: err.to_string(),
                });
            }
        };
        self.remove_if_present(&dir, name)?;
        self.remove_if_present(&dir, &public_key_file(name))?;
        debug!(key = name, "removed local key pair");
        Ok(())
    }
}
