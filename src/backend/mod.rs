//! Backend abstraction for lab resources.
//!
//! A backend adapter creates, lists and deletes servers, volumes and SSH keys
//! on one infrastructure. Provider quirks stay inside the adapter; the
//! orchestrator only sees this trait. Every delete returns a [`DeleteStatus`]
//! and applies the TTL gate itself, so a refused deletion is visible as
//! [`DeleteStatus::Deferred`] rather than an error.

pub mod memory;

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::labels::{LabelSelector, Labels};
use crate::model::{DeleteStatus, ResourceKind, Server, SshKey, Volume};

/// Parameters required to create a server.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerRequest {
    /// Backend name (`{lab}-{short}`).
    pub name: String,
    /// Backend-specific server type (for example `cx22`).
    pub server_type: String,
    /// Human readable image label the backend resolves to an image.
    pub image: String,
    /// Target location (for example `nbg1`).
    pub location: String,
    /// Backend identifier recorded on the server.
    pub provider: String,
    /// Names of keys already registered with the backend.
    pub ssh_key_names: Vec<String>,
    /// Labels to attach, including `lab_name` and `delete_after`.
    pub labels: Labels,
    /// First-boot user data.
    pub user_data: Option<String>,
    /// Lifetime, such as `2h`.
    pub ttl: String,
}

impl ServerRequest {
    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when any required string field is
    /// empty or no SSH key is named.
    pub fn validate(&self) -> Result<(), BackendError> {
        require(ResourceKind::Server, "name", &self.name)?;
        require(ResourceKind::Server, "server_type", &self.server_type)?;
        require(ResourceKind::Server, "image", &self.image)?;
        require(ResourceKind::Server, "location", &self.location)?;
        if self.ssh_key_names.is_empty() {
            return Err(BackendError::Validation {
                kind: ResourceKind::Server,
                field: String::from("ssh_key_names"),
            });
        }
        Ok(())
    }
}

/// Parameters required to create a volume.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeRequest {
    /// Backend name (`{lab}-{short}`).
    pub name: String,
    /// Size in gigabytes.
    pub size_gb: u32,
    /// Backend name of the server to attach to.
    pub server_name: Option<String>,
    /// Target location; ignored when attaching to a server.
    pub location: String,
    /// Whether the backend mounts the volume.
    pub automount: bool,
    /// Filesystem format (for example `xfs`).
    pub format: String,
    /// Labels to attach.
    pub labels: Labels,
    /// Lifetime, such as `2h`.
    pub ttl: String,
}

impl VolumeRequest {
    /// Validates the request.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when the name or format is empty
    /// or the size is zero.
    pub fn validate(&self) -> Result<(), BackendError> {
        require(ResourceKind::Volume, "name", &self.name)?;
        require(ResourceKind::Volume, "format", &self.format)?;
        if self.size_gb == 0 {
            return Err(BackendError::Validation {
                kind: ResourceKind::Volume,
                field: String::from("size_gb"),
            });
        }
        Ok(())
    }
}

/// Parameters required to register an SSH key.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SshKeyRequest {
    /// Key name.
    pub name: String,
    /// OpenSSH public key line.
    pub public_key: String,
    /// Labels to attach.
    pub labels: Labels,
    /// Lifetime, such as `2h`.
    pub ttl: String,
}

impl SshKeyRequest {
    /// Validates the request.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when the name or key is empty.
    pub fn validate(&self) -> Result<(), BackendError> {
        require(ResourceKind::SshKey, "name", &self.name)?;
        require(ResourceKind::SshKey, "public_key", &self.public_key)
    }
}

fn require(kind: ResourceKind, field: &str, value: &str) -> Result<(), BackendError> {
    if value.trim().is_empty() {
        return Err(BackendError::Validation {
            kind,
            field: field.to_owned(),
        });
    }
    Ok(())
}

/// Errors raised by backends.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when the named resource does not exist.
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing resource.
        kind: ResourceKind,
        /// Name of the missing resource.
        name: String,
    },
    /// Raised when a resource with the same name already exists.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Kind of the conflicting resource.
        kind: ResourceKind,
        /// Name of the conflicting resource.
        name: String,
    },
    /// Raised when a request is missing a required field.
    #[error("invalid {kind} request: missing or empty field {field}")]
    Validation {
        /// Kind of resource being requested.
        kind: ResourceKind,
        /// Offending field.
        field: String,
    },
    /// Raised when the provider API or tool fails.
    #[error("provider error: {message}")]
    Provider {
        /// Provider supplied message.
        message: String,
    },
}

impl BackendError {
    /// Returns `true` for the recoverable not-found condition.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Future returned by backend delete operations.
pub type DeleteFuture<'a> = Pin<Box<dyn Future<Output = DeleteStatus> + Send + 'a>>;

/// Capability interface implemented by infrastructure adapters.
///
/// Deletes honour the `delete_after` label unless `force` is set. Adapters for
/// providers with a single long-lived key report that key through
/// [`Backend::key_exists`] and never delete it on behalf of a lab.
pub trait Backend: Send + Sync {
    /// Backend identifier recorded on created resources.
    fn name(&self) -> &str;

    /// Creates a server.
    fn create_server<'a>(&'a self, request: &'a ServerRequest) -> BackendFuture<'a, Server>;

    /// Fetches a server by name.
    fn get_server<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Server>;

    /// Lists servers matching `selector`.
    fn list_servers<'a>(&'a self, selector: &'a LabelSelector) -> BackendFuture<'a, Vec<Server>>;

    /// Lists every server the backend knows about.
    fn all_servers(&self) -> BackendFuture<'_, Vec<Server>>;

    /// Deletes a server, subject to its TTL unless `force` is set.
    fn delete_server<'a>(&'a self, name: &'a str, force: bool) -> DeleteFuture<'a>;

    /// Creates a volume, attaching it when the request names a server.
    fn create_volume<'a>(&'a self, request: &'a VolumeRequest) -> BackendFuture<'a, Volume>;

    /// Fetches a volume by name.
    fn get_volume<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Volume>;

    /// Lists volumes matching `selector`.
    fn list_volumes<'a>(&'a self, selector: &'a LabelSelector) -> BackendFuture<'a, Vec<Volume>>;

    /// Lists every volume the backend knows about.
    fn all_volumes(&self) -> BackendFuture<'_, Vec<Volume>>;

    /// Deletes a volume, subject to its TTL unless `force` is set.
    fn delete_volume<'a>(&'a self, name: &'a str, force: bool) -> DeleteFuture<'a>;

    /// Registers an SSH key.
    fn create_ssh_key<'a>(&'a self, request: &'a SshKeyRequest) -> BackendFuture<'a, SshKey>;

    /// Fetches an SSH key by name.
    fn get_ssh_key<'a>(&'a self, name: &'a str) -> BackendFuture<'a, SshKey>;

    /// Lists every SSH key the backend knows about.
    fn all_ssh_keys(&self) -> BackendFuture<'_, Vec<SshKey>>;

    /// Deletes an SSH key, subject to its TTL unless `force` is set.
    fn delete_ssh_key<'a>(&'a self, name: &'a str, force: bool) -> DeleteFuture<'a>;

    /// Reports whether a key with this name is registered.
    fn key_exists<'a>(&'a self, name: &'a str) -> BackendFuture<'a, bool>;
}
