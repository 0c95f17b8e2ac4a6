//! Lab lifecycle orchestration.
//!
//! [`LabOrchestrator`] composes a lab's keys, servers and volumes through a
//! [`Backend`], gates volume creation on the [`ReadinessChecker`], and keeps
//! the [`LabStore`] cache in step with the backend. Creation is fail-fast and
//! never rolls back; deletion is a best-effort sweep gated by the lab's
//! `delete_after` label.

mod create;
mod delete;
mod query;

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use delete::{LabDeletion, ReapSummary, ResourceDeletion};

use crate::backend::{Backend, BackendError};
use crate::cloud_init::CloudInitError;
use crate::config::{LabConfig, NO_EMAIL, NO_ORGANIZATION, NO_OWNER};
use crate::keys::{KeyError, KeyStore};
use crate::readiness::{DEFAULT_ADMIN_USER, ReadinessChecker, ReadinessError};
use crate::remote::SshTransport;
use crate::store::{LabStore, StoreError};
use crate::ttl::{Clock, DEFAULT_TTL, SystemClock, TtlError};

/// Defaults applied to every lab the orchestrator creates.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LabSettings {
    /// Owner label.
    pub owner: String,
    /// Organization label.
    pub organization: String,
    /// Email label.
    pub email: String,
    /// Provider used when the lab names none.
    pub default_provider: String,
    /// Location used when the lab names none.
    pub default_location: String,
    /// Lifetime used when the lab has no ttl.
    pub default_ttl: String,
    /// Long-lived provider key attached to every server when it exists.
    pub default_key_name: Option<String>,
    /// Login installed by cloud-init.
    pub admin_user: String,
    /// Filesystem for volumes that do not name one.
    pub volume_format: String,
    /// Automount flag for volumes that do not set one.
    pub volume_automount: bool,
}

impl Default for LabSettings {
    fn default() -> Self {
        Self {
            owner: String::from(NO_OWNER),
            organization: String::from(NO_ORGANIZATION),
            email: String::from(NO_EMAIL),
            default_provider: String::from("hetzner"),
            default_location: String::from("nbg1"),
            default_ttl: String::from(DEFAULT_TTL),
            default_key_name: None,
            admin_user: String::from(DEFAULT_ADMIN_USER),
            volume_format: String::from("xfs"),
            volume_automount: false,
        }
    }
}

impl LabSettings {
    /// Extracts lab defaults from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &LabConfig) -> Self {
        Self {
            owner: config.owner.clone(),
            organization: config.organization.clone(),
            email: config.email.clone(),
            default_provider: config.default_provider.clone(),
            default_location: config.default_location.clone(),
            default_ttl: config.default_ttl.clone(),
            default_key_name: config.default_key_name().map(str::to_owned),
            admin_user: config.admin_user.trim().to_owned(),
            volume_format: config.volume_format.clone(),
            volume_automount: config.volume_automount,
        }
    }
}

/// Errors surfaced by lab operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LabError {
    /// Raised when a lab definition is inconsistent.
    #[error("invalid lab {lab}: {reason}")]
    Validation {
        /// Lab name.
        lab: String,
        /// What is wrong with the definition.
        reason: String,
    },
    /// Raised when neither the cache nor the backend knows the lab.
    #[error("lab {lab} not found")]
    NotFound {
        /// Lab name.
        lab: String,
    },
    /// Raised when the lab ttl cannot be parsed.
    #[error(transparent)]
    Ttl(#[from] TtlError),
    /// Raised when the lab's admin key is already registered.
    #[error("ssh key {key} already exists; delete the previous lab before creating it again")]
    AdminKeyExists {
        /// Admin key name.
        key: String,
    },
    /// Raised when a backend call fails.
    #[error("failed to {action}: {source}")]
    Backend {
        /// What the orchestrator was doing.
        action: String,
        /// Backend failure.
        #[source]
        source: BackendError,
    },
    /// Raised when the local key pair cannot be managed.
    #[error(transparent)]
    Keys(#[from] KeyError),
    /// Raised when user data cannot be rendered.
    #[error(transparent)]
    CloudInit(#[from] CloudInitError),
    /// Raised when a server fails its readiness check.
    #[error("server {server} is not ready: {reason}")]
    ServerNotReady {
        /// Server name.
        server: String,
        /// Why the readiness check ended.
        #[source]
        reason: ReadinessError,
    },
    /// Raised when the local cache fails.
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn backend_failure(action: impl Into<String>) -> impl FnOnce(BackendError) -> LabError {
    let action = action.into();
    move |source| LabError::Backend { action, source }
}

/// Coordinates lab creation, lookup, cache rebuilds and teardown.
#[derive(Debug)]
pub struct LabOrchestrator<B, K, T> {
    backend: B,
    keys: K,
    checker: ReadinessChecker<T>,
    store: LabStore,
    clock: Arc<dyn Clock>,
    settings: LabSettings,
    cancel: CancellationToken,
}

impl<B, K, T> LabOrchestrator<B, K, T>
where
    B: Backend,
    K: KeyStore,
    T: SshTransport + 'static,
{
    /// Creates an orchestrator with default settings and the system clock.
    #[must_use]
    pub fn new(backend: B, keys: K, checker: ReadinessChecker<T>, store: LabStore) -> Self {
        Self {
            backend,
            keys,
            checker,
            store,
            clock: Arc::new(SystemClock),
            settings: LabSettings::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `clock` for creation stamps and deletion gates.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the lab defaults.
    #[must_use]
    pub fn with_settings(mut self, settings: LabSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Uses `cancel` to abort in-flight readiness checks.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts readiness checks started by this orchestrator.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Backend the orchestrator drives.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Local lab cache.
    #[must_use]
    pub const fn store(&self) -> &LabStore {
        &self.store
    }

    /// Lab defaults in effect.
    #[must_use]
    pub const fn settings(&self) -> &LabSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests;
