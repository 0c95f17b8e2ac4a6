//! In-memory backend.
//!
//! Keeps servers, volumes and keys in ordered maps behind a mutex and applies
//! the same TTL gate real adapters do. Handles are cheap clones sharing one
//! state, so a test can keep a handle for seeding, failure injection and call
//! assertions while the orchestrator owns another.

use std::collections::{BTreeMap, BTreeSet};
use std::future::ready;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::{
    Backend, BackendError, BackendFuture, DeleteFuture, ServerRequest, SshKeyRequest,
    VolumeRequest,
};
use crate::labels::{self, LabelSelector, Labels};
use crate::model::{
    DeleteStatus, PublicNet, ResourceKind, Server, ServerSpec, ServerStatus, SshKey, Volume,
    VolumeSpec, VolumeStatus,
};
use crate::ttl::{self, Clock, SystemClock};

/// First address handed out to servers (`10.0.0.1`).
const FIRST_ADDRESS: u32 = 0x0a00_0001;

/// Backend operation, used for failure injection and the call journal.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    /// [`Backend::create_server`].
    CreateServer,
    /// [`Backend::get_server`].
    GetServer,
    /// [`Backend::list_servers`].
    ListServers,
    /// [`Backend::all_servers`].
    AllServers,
    /// [`Backend::delete_server`].
    DeleteServer,
    /// [`Backend::create_volume`].
    CreateVolume,
    /// [`Backend::get_volume`].
    GetVolume,
    /// [`Backend::list_volumes`].
    ListVolumes,
    /// [`Backend::all_volumes`].
    AllVolumes,
    /// [`Backend::delete_volume`].
    DeleteVolume,
    /// [`Backend::create_ssh_key`].
    CreateSshKey,
    /// [`Backend::get_ssh_key`].
    GetSshKey,
    /// [`Backend::all_ssh_keys`].
    AllSshKeys,
    /// [`Backend::delete_ssh_key`].
    DeleteSshKey,
    /// [`Backend::key_exists`].
    KeyExists,
}

impl Operation {
    /// Returns `true` for operations that remove resources.
    #[must_use]
    pub const fn is_destructive(self) -> bool {
        matches!(
            self,
            Self::DeleteServer | Self::DeleteVolume | Self::DeleteSshKey
        )
    }
}

/// Journal entry recorded for every backend call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Call {
    /// Operation invoked.
    pub operation: Operation,
    /// Resource name or selector the call targeted, if any.
    pub target: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    servers: BTreeMap<String, Server>,
    volumes: BTreeMap<String, Volume>,
    keys: BTreeMap<String, SshKey>,
    failures: BTreeMap<Operation, String>,
    protected_keys: BTreeSet<String>,
    calls: Vec<Call>,
    next_address: u32,
}

/// Reference backend holding resources in memory.
#[derive(Clone, Debug)]
pub struct MemoryBackend {
    name: String,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<State>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates an empty backend named `memory` using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: String::from("memory"),
            clock: Arc::new(SystemClock),
            state: Arc::new(Mutex::new(State {
                next_address: FIRST_ADDRESS,
                ..State::default()
            })),
        }
    }

    /// Overrides the backend identifier.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Uses `clock` for creation times and the TTL gate.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Makes every subsequent `operation` fail with a provider error.
    pub fn fail_on(&self, operation: Operation, message: impl Into<String>) {
        self.state().failures.insert(operation, message.into());
    }

    /// Stops injecting failures for `operation`.
    pub fn clear_failure(&self, operation: Operation) {
        self.state().failures.remove(&operation);
    }

    /// Registers a long-lived key that deletes always refuse to remove.
    pub fn add_protected_key(&self, name: &str, public_key: &str) {
        let mut state = self.state();
        state.protected_keys.insert(name.to_owned());
        state.keys.insert(
            name.to_owned(),
            SshKey {
                name: name.to_owned(),
                public_key: public_key.to_owned(),
                ..SshKey::default()
            },
        );
    }

    /// Inserts a server as if it had been created out of band.
    pub fn insert_server(&self, server: Server) {
        self.state().servers.insert(server.name.clone(), server);
    }

    /// Removes a server out of band, bypassing the TTL gate and the journal.
    #[must_use]
    pub fn remove_server(&self, name: &str) -> Option<Server> {
        self.state().servers.remove(name)
    }

    /// Snapshot of every server.
    #[must_use]
    pub fn servers(&self) -> Vec<Server> {
        self.state().servers.values().cloned().collect()
    }

    /// Snapshot of every volume.
    #[must_use]
    pub fn volumes(&self) -> Vec<Volume> {
        self.state().volumes.values().cloned().collect()
    }

    /// Snapshot of every key.
    #[must_use]
    pub fn ssh_keys(&self) -> Vec<SshKey> {
        self.state().keys.values().cloned().collect()
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Calls that attempted to remove a resource.
    #[must_use]
    pub fn destructive_calls(&self) -> Vec<Call> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.operation.is_destructive())
            .cloned()
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(
        &self,
        operation: Operation,
        target: Option<&str>,
    ) -> Result<MutexGuard<'_, State>, BackendError> {
        let mut state = self.state();
        state.calls.push(Call {
            operation,
            target: target.map(str::to_owned),
        });
        if let Some(message) = state.failures.get(&operation) {
            return Err(BackendError::Provider {
                message: message.clone(),
            });
        }
        Ok(state)
    }

    fn stamp(&self, request_labels: &Labels) -> (DateTime<Utc>, Option<DateTime<Utc>>, String) {
        let created = self.clock.now();
        let delete_after = request_labels
            .get(labels::DELETE_AFTER)
            .and_then(|value| ttl::parse_delete_after(value));
        let owner = request_labels
            .get(labels::OWNER)
            .cloned()
            .unwrap_or_default();
        (created, delete_after, owner)
    }

    fn create_server_now(&self, request: &ServerRequest) -> Result<Server, BackendError> {
        request.validate()?;
        let mut state = self.begin(Operation::CreateServer, Some(&request.name))?;
        if state.servers.contains_key(&request.name) {
            return Err(BackendError::AlreadyExists {
                kind: ResourceKind::Server,
                name: request.name.clone(),
            });
        }
        if let Some(missing) = request
            .ssh_key_names
            .iter()
            .find(|key| !state.keys.contains_key(*key))
        {
            return Err(BackendError::NotFound {
                kind: ResourceKind::SshKey,
                name: missing.clone(),
            });
        }

        let (created, delete_after, owner) = self.stamp(&request.labels);
        let address = Ipv4Addr::from(state.next_address);
        state.next_address = state.next_address.saturating_add(1);
        let server = Server {
            name: request.name.clone(),
            labels: request.labels.clone(),
            spec: ServerSpec {
                server_type: request.server_type.clone(),
                image: request.image.clone(),
                location: request.location.clone(),
                provider: self.name.clone(),
                ssh_key_names: request.ssh_key_names.clone(),
                ttl: request.ttl.clone(),
            },
            status: ServerStatus {
                state: String::from("running"),
                owner,
                cores: 2,
                memory_mb: 4096,
                disk_gb: 40,
                public_net: PublicNet {
                    ipv4: Some(IpAddr::V4(address)),
                    ipv6: None,
                    fqdn: None,
                },
                created: Some(created),
                delete_after,
            },
        };
        state.servers.insert(server.name.clone(), server.clone());
        Ok(server)
    }

    fn create_volume_now(&self, request: &VolumeRequest) -> Result<Volume, BackendError> {
        request.validate()?;
        let mut state = self.begin(Operation::CreateVolume, Some(&request.name))?;
        if state.volumes.contains_key(&request.name) {
            return Err(BackendError::AlreadyExists {
                kind: ResourceKind::Volume,
                name: request.name.clone(),
            });
        }
        let location = match &request.server_name {
            Some(server_name) => state
                .servers
                .get(server_name)
                .map(|server| server.spec.location.clone())
                .ok_or_else(|| BackendError::NotFound {
                    kind: ResourceKind::Server,
                    name: server_name.clone(),
                })?,
            None => request.location.clone(),
        };

        let (created, delete_after, owner) = self.stamp(&request.labels);
        let volume = Volume {
            name: request.name.clone(),
            labels: request.labels.clone(),
            spec: VolumeSpec {
                size_gb: request.size_gb,
                server_name: request.server_name.clone(),
                automount: request.automount,
                format: request.format.clone(),
                location,
                provider: self.name.clone(),
                ttl: request.ttl.clone(),
            },
            status: VolumeStatus {
                state: String::from("available"),
                owner,
                created: Some(created),
                delete_after,
            },
        };
        state.volumes.insert(volume.name.clone(), volume.clone());
        Ok(volume)
    }

    fn create_ssh_key_now(&self, request: &SshKeyRequest) -> Result<SshKey, BackendError> {
        request.validate()?;
        let mut state = self.begin(Operation::CreateSshKey, Some(&request.name))?;
        if state.keys.contains_key(&request.name) {
            return Err(BackendError::AlreadyExists {
                kind: ResourceKind::SshKey,
                name: request.name.clone(),
            });
        }
        let (created, delete_after, _) = self.stamp(&request.labels);
        let key = SshKey {
            name: request.name.clone(),
            labels: request.labels.clone(),
            public_key: request.public_key.clone(),
            ttl: request.ttl.clone(),
            created: Some(created),
            delete_after,
        };
        state.keys.insert(key.name.clone(), key.clone());
        Ok(key)
    }

    fn lookup<T: Clone>(
        &self,
        operation: Operation,
        kind: ResourceKind,
        name: &str,
        pick: impl FnOnce(&State) -> Option<&T>,
    ) -> Result<T, BackendError> {
        let state = self.begin(operation, Some(name))?;
        pick(&state).cloned().ok_or_else(|| BackendError::NotFound {
            kind,
            name: name.to_owned(),
        })
    }

    fn collect<T: Clone>(
        &self,
        operation: Operation,
        selector: Option<&LabelSelector>,
        pick: impl FnOnce(&State) -> Vec<(&Labels, &T)>,
    ) -> Result<Vec<T>, BackendError> {
        let rendered = selector.map(ToString::to_string);
        let state = self.begin(operation, rendered.as_deref())?;
        Ok(pick(&state)
            .into_iter()
            .filter(|(resource_labels, _)| selector.is_none_or(|sel| sel.matches(resource_labels)))
            .map(|(_, resource)| resource.clone())
            .collect())
    }

    fn delete_now(
        &self,
        operation: Operation,
        kind: ResourceKind,
        name: &str,
        force: bool,
    ) -> DeleteStatus {
        let mut state = match self.begin(operation, Some(name)) {
            Ok(state) => state,
            Err(error) => return DeleteStatus::Failed { error },
        };
        let now = self.clock.now();
        let not_found = || DeleteStatus::Failed {
            error: BackendError::NotFound {
                kind,
                name: name.to_owned(),
            },
        };

        let recorded = match kind {
            ResourceKind::Server => state.servers.get(name).map(|s| s.status.delete_after),
            ResourceKind::Volume => state.volumes.get(name).map(|v| v.status.delete_after),
            ResourceKind::SshKey => {
                if state.protected_keys.contains(name) {
                    return DeleteStatus::Failed {
                        error: BackendError::Provider {
                            message: format!("ssh key {name} is managed outside labs"),
                        },
                    };
                }
                state.keys.get(name).map(|k| k.delete_after)
            }
        };
        let Some(delete_after) = recorded else {
            return not_found();
        };
        if let Some(eligible) = ttl::refused_until(delete_after, now, force) {
            return DeleteStatus::Deferred {
                delete_after: eligible,
            };
        }

        match kind {
            ResourceKind::Server => {
                state.servers.remove(name);
                for volume in state.volumes.values_mut() {
                    if volume.spec.server_name.as_deref() == Some(name) {
                        volume.spec.server_name = None;
                    }
                }
            }
            ResourceKind::Volume => {
                state.volumes.remove(name);
            }
            ResourceKind::SshKey => {
                state.keys.remove(name);
            }
        }
        DeleteStatus::Deleted
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_server<'a>(&'a self, request: &'a ServerRequest) -> BackendFuture<'a, Server> {
        Box::pin(ready(self.create_server_now(request)))
    }

    fn get_server<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Server> {
        Box::pin(ready(self.lookup(
            Operation::GetServer,
            ResourceKind::Server,
            name,
            |state| state.servers.get(name),
        )))
    }

    fn list_servers<'a>(&'a self, selector: &'a LabelSelector) -> BackendFuture<'a, Vec<Server>> {
        Box::pin(ready(self.collect(Operation::ListServers, Some(selector), |state| {
            state.servers.values().map(|s| (&s.labels, s)).collect()
        })))
    }

    fn all_servers(&self) -> BackendFuture<'_, Vec<Server>> {
        Box::pin(ready(self.collect(Operation::AllServers, None, |state| {
            state.servers.values().map(|s| (&s.labels, s)).collect()
        })))
    }

    fn delete_server<'a>(&'a self, name: &'a str, force: bool) -> DeleteFuture<'a> {
        Box::pin(ready(self.delete_now(
            Operation::DeleteServer,
            ResourceKind::Server,
            name,
            force,
        )))
    }

    fn create_volume<'a>(&'a self, request: &'a VolumeRequest) -> BackendFuture<'a, Volume> {
        Box::pin(ready(self.create_volume_now(request)))
    }

    fn get_volume<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Volume> {
        Box::pin(ready(self.lookup(
            Operation::GetVolume,
            ResourceKind::Volume,
            name,
            |state| state.volumes.get(name),
        )))
    }

    fn list_volumes<'a>(&'a self, selector: &'a LabelSelector) -> BackendFuture<'a, Vec<Volume>> {
        Box::pin(ready(self.collect(Operation::ListVolumes, Some(selector), |state| {
            state.volumes.values().map(|v| (&v.labels, v)).collect()
        })))
    }

    fn all_volumes(&self) -> BackendFuture<'_, Vec<Volume>> {
        Box::pin(ready(self.collect(Operation::AllVolumes, None, |state| {
            state.volumes.values().map(|v| (&v.labels, v)).collect()
        })))
    }

    fn delete_volume<'a>(&'a self, name: &'a str, force: bool) -> DeleteFuture<'a> {
        Box::pin(ready(self.delete_now(
            Operation::DeleteVolume,
            ResourceKind::Volume,
            name,
            force,
        )))
    }

    fn create_ssh_key<'a>(&'a self, request: &'a SshKeyRequest) -> BackendFuture<'a, SshKey> {
        Box::pin(ready(self.create_ssh_key_now(request)))
    }

    fn get_ssh_key<'a>(&'a self, name: &'a str) -> BackendFuture<'a, SshKey> {
        Box::pin(ready(self.lookup(
            Operation::GetSshKey,
            ResourceKind::SshKey,
            name,
            |state| state.keys.get(name),
        )))
    }

    fn all_ssh_keys(&self) -> BackendFuture<'_, Vec<SshKey>> {
        Box::pin(ready(self.collect(Operation::AllSshKeys, None, |state| {
            state.keys.values().map(|k| (&k.labels, k)).collect()
        })))
    }

    fn delete_ssh_key<'a>(&'a self, name: &'a str, force: bool) -> DeleteFuture<'a> {
        Box::pin(ready(self.delete_now(
            Operation::DeleteSshKey,
            ResourceKind::SshKey,
            name,
            force,
        )))
    }

    fn key_exists<'a>(&'a self, name: &'a str) -> BackendFuture<'a, bool> {
        Box::pin(ready(
            self.begin(Operation::KeyExists, Some(name))
                .map(|state| state.keys.contains_key(name)),
        ))
    }
}
