//! Cache reads, backend reconstruction and full cache rebuilds.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::{LabError, LabOrchestrator, backend_failure};
use crate::backend::Backend;
use crate::keys::KeyStore;
use crate::labels::{self, LabelSelector};
use crate::model::{Lab, LabServer, LabSpec, LabStatus, LabVolume, Server, Volume};
use crate::remote::SshTransport;
use crate::ttl;

fn short_name<'a>(lab: &str, name: &'a str) -> &'a str {
    name.strip_prefix(lab)
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(name)
}

/// Rebuilds a lab record from its backend resources.
///
/// Status fields come from the first server: its labels, creation time,
/// `delete_after`, location and provider.
fn reconstruct(name: &str, servers: Vec<Server>, volumes: Vec<Volume>) -> Option<Lab> {
    let first = servers.first()?;
    let delete_after = first
        .labels
        .get(labels::DELETE_AFTER)
        .and_then(|value| ttl::parse_delete_after(value))
        .or(first.status.delete_after);
    let owner = first
        .labels
        .get(labels::OWNER)
        .cloned()
        .unwrap_or_else(|| first.status.owner.clone());

    let spec = LabSpec {
        provider: first.spec.provider.clone(),
        location: first.spec.location.clone(),
        ttl: first.spec.ttl.clone(),
        servers: servers
            .iter()
            .map(|server| LabServer {
                name: short_name(name, &server.name).to_owned(),
                server_type: server.spec.server_type.clone(),
                image: server.spec.image.clone(),
            })
            .collect(),
        volumes: volumes
            .iter()
            .map(|volume| LabVolume {
                name: short_name(name, &volume.name).to_owned(),
                server: volume
                    .spec
                    .server_name
                    .as_deref()
                    .map(|server| short_name(name, server).to_owned()),
                size: volume.spec.size_gb,
                automount: Some(volume.spec.automount),
                format: Some(volume.spec.format.clone()),
            })
            .collect(),
    };
    let state = first.status.state.clone();
    let created = first.status.created;
    let lab_labels = first.labels.clone();
    Some(Lab {
        name: name.to_owned(),
        labels: lab_labels,
        spec,
        status: LabStatus {
            state,
            owner,
            created,
            delete_after,
            servers,
            volumes,
        },
    })
}

impl<B, K, T> LabOrchestrator<B, K, T>
where
    B: Backend,
    K: KeyStore,
    T: SshTransport + 'static,
{
    /// Returns the cached lab, or rebuilds it from the backend and caches it.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::NotFound`] when no backend server carries the lab's
    /// `lab_name` label, or the backend or store error that stopped the
    /// lookup.
    pub async fn get(&self, name: &str) -> Result<Lab, LabError> {
        if let Some(lab) = self.store.get(name)? {
            debug!(lab = %name, "lab cache hit");
            return Ok(lab);
        }
        debug!(lab = %name, "lab cache miss");
        let lab = self.fetch(name).await?;
        self.store.save(&lab)?;
        Ok(lab)
    }

    /// Returns every cached lab without consulting the backend.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::Store`] when the cache cannot be read.
    pub fn list(&self) -> Result<Vec<Lab>, LabError> {
        Ok(self.store.list()?)
    }

    /// Rebuilds the whole cache from the backend.
    ///
    /// Labs are discovered from the `lab_name` label of every backend server,
    /// each one is re-fetched, and the cache is replaced in one transaction so
    /// labs removed out-of-band disappear. Returns the labs now cached.
    ///
    /// # Errors
    ///
    /// Returns the backend or store error that stopped the rebuild; the
    /// previous cache contents are kept in that case.
    pub async fn sync_labs(&self) -> Result<Vec<Lab>, LabError> {
        let servers = self
            .backend
            .all_servers()
            .await
            .map_err(backend_failure("list servers"))?;
        let names: BTreeSet<String> = servers
            .iter()
            .filter_map(Server::lab_name)
            .map(str::to_owned)
            .collect();

        let mut labs = Vec::with_capacity(names.len());
        for name in &names {
            match self.fetch(name).await {
                Ok(lab) => labs.push(lab),
                Err(LabError::NotFound { .. }) => {
                    warn!(lab = %name, "lab vanished during sync");
                }
                Err(err) => return Err(err),
            }
        }
        self.store.replace_all(&labs)?;
        info!(backend = %self.backend.name(), labs = labs.len(), "lab cache synced");
        Ok(labs)
    }

    pub(super) async fn fetch(&self, name: &str) -> Result<Lab, LabError> {
        let selector = LabelSelector::for_lab(name);
        let servers = self
            .backend
            .list_servers(&selector)
            .await
            .map_err(backend_failure(format!("list servers of lab {name}")))?;
        if servers.is_empty() {
            return Err(LabError::NotFound {
                lab: name.to_owned(),
            });
        }
        let volumes = self
            .backend
            .list_volumes(&selector)
            .await
            .map_err(backend_failure(format!("list volumes of lab {name}")))?;
        debug!(
            lab = %name,
            servers = servers.len(),
            volumes = volumes.len(),
            "lab rebuilt from backend"
        );
        reconstruct(name, servers, volumes).ok_or_else(|| LabError::NotFound {
            lab: name.to_owned(),
        })
    }
}
