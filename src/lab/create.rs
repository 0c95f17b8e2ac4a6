//! Lab creation: keys, servers, readiness gate, volumes, cache.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::{LabError, LabOrchestrator, backend_failure};
use crate::backend::{Backend, ServerRequest, SshKeyRequest, VolumeRequest};
use crate::cloud_init::render_user_data;
use crate::keys::KeyStore;
use crate::labels::{self, Labels, merge_labels, sanitize_value};
use crate::model::{Lab, LabStatus, Server, Volume, child_name};
use crate::readiness::ReadinessRequest;
use crate::remote::SshTransport;
use crate::ttl;

fn invalid(lab: &Lab, reason: impl Into<String>) -> LabError {
    LabError::Validation {
        lab: lab.name.clone(),
        reason: reason.into(),
    }
}

fn require_unique<'a>(
    lab: &Lab,
    kind: &str,
    names: impl Iterator<Item = &'a str>,
) -> Result<BTreeSet<&'a str>, LabError> {
    let mut seen = BTreeSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(invalid(lab, format!("{kind} names must not be empty")));
        }
        if !seen.insert(name) {
            return Err(invalid(lab, format!("duplicate {kind} name {name}")));
        }
    }
    Ok(seen)
}

/// Checks the lab definition before any backend call is made.
fn validate_lab(lab: &Lab) -> Result<(), LabError> {
    if lab.name.is_empty() || sanitize_value(&lab.name) != lab.name {
        return Err(invalid(
            lab,
            "lab names may only contain letters, digits, '-' and '_' and must start and end with a letter or digit",
        ));
    }
    if lab.spec.servers.is_empty() {
        return Err(invalid(lab, "a lab needs at least one server"));
    }
    let servers = require_unique(
        lab,
        "server",
        lab.spec.servers.iter().map(|server| server.name.as_str()),
    )?;
    require_unique(
        lab,
        "volume",
        lab.spec.volumes.iter().map(|volume| volume.name.as_str()),
    )?;
    for volume in &lab.spec.volumes {
        if volume.size == 0 {
            return Err(invalid(lab, format!("volume {} has zero size", volume.name)));
        }
        if let Some(server) = volume.server.as_deref()
            && !servers.contains(server)
        {
            return Err(invalid(
                lab,
                format!("volume {} references unknown server {server}", volume.name),
            ));
        }
    }
    Ok(())
}

fn fill_blank(value: &mut String, default: &str) {
    if value.trim().is_empty() {
        default.clone_into(value);
    }
}

impl<B, K, T> LabOrchestrator<B, K, T>
where
    B: Backend,
    K: KeyStore,
    T: SshTransport + 'static,
{
    /// Creates every resource of `lab` and caches the result.
    ///
    /// Resources are created in the order admin key, servers (in spec
    /// order), readiness gate, volumes. The first failure stops the sequence
    /// and nothing is rolled back; [`LabOrchestrator::delete`] cleans up.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Validation`] for inconsistent definitions,
    /// [`LabError::AdminKeyExists`] when a previous lab left its key behind,
    /// [`LabError::ServerNotReady`] naming the first unready server, and the
    /// backend, key, cloud-init or store error that stopped creation.
    pub async fn create(&self, mut lab: Lab) -> Result<Lab, LabError> {
        validate_lab(&lab)?;
        fill_blank(&mut lab.spec.ttl, &self.settings.default_ttl);
        fill_blank(&mut lab.spec.provider, &self.settings.default_provider);
        fill_blank(&mut lab.spec.location, &self.settings.default_location);

        let created = self.clock.now();
        let delete_after = ttl::delete_after_from(created, &lab.spec.ttl)?;
        lab.labels = self.stamp_labels(&lab, delete_after);
        info!(
            lab = %lab.name,
            provider = %lab.spec.provider,
            location = %lab.spec.location,
            ttl = %lab.spec.ttl,
            %delete_after,
            "creating lab"
        );

        let (public_key, key_names) = self.create_keys(&lab).await?;
        let servers = self.create_servers(&lab, &public_key, &key_names).await?;
        self.await_readiness(&lab, &servers).await?;
        let volumes = self.create_volumes(&lab).await?;

        lab.status = LabStatus {
            state: servers
                .first()
                .map(|server| server.status.state.clone())
                .unwrap_or_default(),
            owner: lab.labels.get(labels::OWNER).cloned().unwrap_or_default(),
            created: Some(created),
            delete_after: Some(delete_after),
            servers,
            volumes,
        };
        self.store.save(&lab)?;
        info!(lab = %lab.name, "lab created");
        Ok(lab)
    }

    fn stamp_labels(&self, lab: &Lab, delete_after: DateTime<Utc>) -> Labels {
        let stamped: Labels = [
            (labels::OWNER, sanitize_value(&self.settings.owner)),
            (
                labels::ORGANIZATION,
                sanitize_value(&self.settings.organization),
            ),
            (labels::EMAIL, sanitize_value(&self.settings.email)),
            (labels::LAB_NAME, lab.name.clone()),
            (labels::DELETE_AFTER, ttl::format_delete_after(delete_after)),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect();
        merge_labels(&lab.labels, &stamped)
    }

    async fn create_keys(&self, lab: &Lab) -> Result<(String, Vec<String>), LabError> {
        let admin_key = lab.admin_key_name();
        let exists = self
            .backend
            .key_exists(&admin_key)
            .await
            .map_err(backend_failure(format!("look up ssh key {admin_key}")))?;
        if exists {
            return Err(LabError::AdminKeyExists { key: admin_key });
        }

        let public_key = self.keys.create_key_pair(&admin_key)?;
        let request = SshKeyRequest {
            name: admin_key.clone(),
            public_key: public_key.clone(),
            labels: lab.labels.clone(),
            ttl: lab.spec.ttl.clone(),
        };
        let key = self
            .backend
            .create_ssh_key(&request)
            .await
            .map_err(backend_failure(format!("create ssh key {admin_key}")))?;
        info!(lab = %lab.name, key = %key.name, "created admin ssh key");

        let mut key_names = vec![admin_key];
        if let Some(default_key) = self.settings.default_key_name.as_deref() {
            let present = self
                .backend
                .key_exists(default_key)
                .await
                .map_err(backend_failure(format!("look up ssh key {default_key}")))?;
            if present {
                key_names.push(default_key.to_owned());
            } else {
                warn!(lab = %lab.name, key = %default_key, "default ssh key not found on backend");
            }
        }
        Ok((public_key, key_names))
    }

    async fn create_servers(
        &self,
        lab: &Lab,
        public_key: &str,
        key_names: &[String],
    ) -> Result<Vec<Server>, LabError> {
        let user_data = render_user_data(&self.settings.admin_user, public_key)?;
        let mut servers = Vec::with_capacity(lab.spec.servers.len());
        for spec in &lab.spec.servers {
            let request = ServerRequest {
                name: lab.child_name(&spec.name),
                server_type: spec.server_type.clone(),
                image: spec.image.clone(),
                location: lab.spec.location.clone(),
                provider: lab.spec.provider.clone(),
                ssh_key_names: key_names.to_vec(),
                labels: lab.labels.clone(),
                user_data: Some(user_data.clone()),
                ttl: lab.spec.ttl.clone(),
            };
            let server = self
                .backend
                .create_server(&request)
                .await
                .map_err(backend_failure(format!("create server {}", request.name)))?;
            info!(
                lab = %lab.name,
                server = %server.name,
                address = ?server.status.public_net.ssh_host(),
                "created server"
            );
            servers.push(server);
        }
        Ok(servers)
    }

    async fn await_readiness(&self, lab: &Lab, servers: &[Server]) -> Result<(), LabError> {
        let identity_file = self.keys.private_key_path(&lab.admin_key_name());
        let requests = servers
            .iter()
            .map(|server| ReadinessRequest {
                server: server.clone(),
                identity_file: identity_file.clone(),
            })
            .collect();
        let report = self.checker.check_servers(requests, &self.cancel).await;

        for failure in report.failures() {
            error!(lab = %lab.name, server = %failure.server(), error = %failure, "server not ready");
        }
        if let Some(failure) = report.failures().next() {
            return Err(LabError::ServerNotReady {
                server: failure.server().to_owned(),
                reason: failure.clone(),
            });
        }
        info!(lab = %lab.name, servers = servers.len(), "all servers ready");
        Ok(())
    }

    async fn create_volumes(&self, lab: &Lab) -> Result<Vec<Volume>, LabError> {
        let mut volumes = Vec::with_capacity(lab.spec.volumes.len());
        for spec in &lab.spec.volumes {
            let format = spec
                .format
                .as_deref()
                .map(str::trim)
                .filter(|format| !format.is_empty())
                .unwrap_or(self.settings.volume_format.as_str());
            let request = VolumeRequest {
                name: lab.child_name(&spec.name),
                size_gb: spec.size,
                server_name: spec.server.as_deref().map(|server| child_name(&lab.name, server)),
                location: lab.spec.location.clone(),
                automount: spec.automount.unwrap_or(self.settings.volume_automount),
                format: format.to_owned(),
                labels: lab.labels.clone(),
                ttl: lab.spec.ttl.clone(),
            };
            let volume = self
                .backend
                .create_volume(&request)
                .await
                .map_err(backend_failure(format!("create volume {}", request.name)))?;
            info!(
                lab = %lab.name,
                volume = %volume.name,
                server = ?volume.spec.server_name,
                size_gb = volume.spec.size_gb,
                "created volume"
            );
            volumes.push(volume);
        }
        Ok(volumes)
    }
}
