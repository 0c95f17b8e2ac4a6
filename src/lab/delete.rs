//! TTL-gated lab teardown and expired-lab reaping.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{error, info, warn};

use super::{LabError, LabOrchestrator};
use crate::backend::Backend;
use crate::keys::KeyStore;
use crate::model::{DeleteStatus, Lab, ResourceKind};
use crate::remote::SshTransport;
use crate::ttl;

/// Outcome for one backend resource of a lab sweep.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceDeletion {
    /// Kind of resource.
    pub kind: ResourceKind,
    /// Backend name of the resource.
    pub name: String,
    /// What the backend reported.
    pub status: DeleteStatus,
}

/// Outcome of [`LabOrchestrator::delete`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LabDeletion {
    /// Lab name.
    pub lab: String,
    /// Aggregate outcome.
    ///
    /// `Deferred` when the lab's TTL has not elapsed (no resource is
    /// touched) or a resource refused deletion, `Failed` with the first
    /// backend failure, otherwise `Deleted`.
    pub status: DeleteStatus,
    /// Per-resource outcomes in sweep order: volumes, servers, keys.
    pub resources: Vec<ResourceDeletion>,
}

impl LabDeletion {
    /// Returns `true` when every resource of the lab is gone.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.status.is_deleted()
    }

    /// Resources the sweep could not remove.
    pub fn leftovers(&self) -> impl Iterator<Item = &ResourceDeletion> {
        self.resources
            .iter()
            .filter(|resource| !resource.status.is_deleted())
    }
}

impl fmt::Display for LabDeletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            DeleteStatus::Deleted => write!(f, "lab {} deleted", self.lab),
            DeleteStatus::Deferred { delete_after } => write!(
                f,
                "lab {} is not ready for deletion until {delete_after}",
                self.lab
            ),
            DeleteStatus::Failed { error } => {
                write!(f, "lab {} only partially deleted: {error}", self.lab)
            }
        }
    }
}

/// Labs handled by [`LabOrchestrator::reap_expired`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReapSummary {
    /// Labs fully deleted.
    pub deleted: Vec<String>,
    /// Labs whose TTL has not elapsed, or with resources that refused
    /// deletion.
    pub deferred: Vec<String>,
    /// Labs whose teardown failed.
    pub failed: Vec<String>,
}

fn aggregate(resources: &[ResourceDeletion]) -> DeleteStatus {
    let failed = resources
        .iter()
        .find_map(|resource| resource.status.error().cloned());
    if let Some(error) = failed {
        return DeleteStatus::Failed { error };
    }
    resources
        .iter()
        .find_map(|resource| resource.status.delete_after())
        .map_or(DeleteStatus::Deleted, |delete_after| {
            DeleteStatus::Deferred { delete_after }
        })
}

fn log_outcome(lab: &str, resource: &ResourceDeletion) {
    match &resource.status {
        DeleteStatus::Deleted => {
            info!(lab = %lab, kind = %resource.kind, name = %resource.name, "deleted");
        }
        DeleteStatus::Deferred { delete_after } => warn!(
            lab = %lab,
            kind = %resource.kind,
            name = %resource.name,
            %delete_after,
            "not ready for deletion"
        ),
        DeleteStatus::Failed { error } => error!(
            lab = %lab,
            kind = %resource.kind,
            name = %resource.name,
            %error,
            "delete failed"
        ),
    }
}

impl<B, K, T> LabOrchestrator<B, K, T>
where
    B: Backend,
    K: KeyStore,
    T: SshTransport + 'static,
{
    /// Tears down lab `name`.
    ///
    /// Unless `force` is set, nothing happens before the lab's
    /// `delete_after` and the result is `Deferred` with that instant. Once
    /// allowed, volumes, servers and the lab's own SSH keys are deleted in
    /// that order; a failure is logged and the sweep moves on, and resources
    /// already missing count as deleted. The local key pair and the cache
    /// record are removed last. The configured default key is never deleted.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::NotFound`] when the lab is unknown, or the store
    /// error raised while reading or dropping its record.
    pub async fn delete(&self, name: &str, force: bool) -> Result<LabDeletion, LabError> {
        let lab = self.get(name).await?;
        let now = self.clock.now();
        if let Some(delete_after) = ttl::refused_until(lab.status.delete_after, now, force) {
            let deletion = LabDeletion {
                lab: lab.name,
                status: DeleteStatus::Deferred { delete_after },
                resources: Vec::new(),
            };
            info!(lab = %name, %delete_after, "{deletion}");
            return Ok(deletion);
        }

        info!(lab = %name, force, "deleting lab");
        let current = self.fetch(name).await.unwrap_or_else(|err| {
            warn!(lab = %name, error = %err, "using cached lab record for deletion");
            lab.clone()
        });

        let mut resources = Vec::new();
        for volume in &current.status.volumes {
            let status = self.backend.delete_volume(&volume.name, force).await;
            resources.push(self.record(name, ResourceKind::Volume, &volume.name, status));
        }
        for server in &current.status.servers {
            let status = self.backend.delete_server(&server.name, force).await;
            resources.push(self.record(name, ResourceKind::Server, &server.name, status));
        }
        for key in self.lab_key_names(&current) {
            let status = self.backend.delete_ssh_key(&key, force).await;
            resources.push(self.record(name, ResourceKind::SshKey, &key, status));
        }

        let admin_key = lab.admin_key_name();
        if let Err(err) = self.keys.delete_key_pair(&admin_key) {
            error!(lab = %name, key = %admin_key, error = %err, "failed to remove local key pair");
        }
        self.store.delete(name)?;

        let deletion = LabDeletion {
            lab: lab.name,
            status: aggregate(&resources),
            resources,
        };
        info!(lab = %name, "{deletion}");
        Ok(deletion)
    }

    /// Syncs the cache, then deletes every lab whose TTL has elapsed.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the cache rebuild. Failures while
    /// deleting individual labs are reported in [`ReapSummary::failed`].
    pub async fn reap_expired(&self) -> Result<ReapSummary, LabError> {
        let labs = self.sync_labs().await?;
        let mut summary = ReapSummary::default();
        for lab in labs {
            match self.delete(&lab.name, false).await {
                Ok(deletion) => match deletion.status {
                    DeleteStatus::Deleted => summary.deleted.push(lab.name),
                    DeleteStatus::Deferred { .. } => summary.deferred.push(lab.name),
                    DeleteStatus::Failed { .. } => summary.failed.push(lab.name),
                },
                Err(err) => {
                    error!(lab = %lab.name, error = %err, "failed to reap lab");
                    summary.failed.push(lab.name);
                }
            }
        }
        info!(
            deleted = summary.deleted.len(),
            deferred = summary.deferred.len(),
            failed = summary.failed.len(),
            "reaped expired labs"
        );
        Ok(summary)
    }

    fn record(
        &self,
        lab: &str,
        kind: ResourceKind,
        name: &str,
        reported: DeleteStatus,
    ) -> ResourceDeletion {
        let status = match reported {
            DeleteStatus::Failed { error } if error.is_not_found() => {
                warn!(lab = %lab, %kind, name = %name, "already missing on backend {}", self.backend.name());
                DeleteStatus::Deleted
            }
            other => other,
        };
        let resource = ResourceDeletion {
            kind,
            name: name.to_owned(),
            status,
        };
        log_outcome(lab, &resource);
        resource
    }

    /// The lab's admin key plus any other `{lab}-` keys its servers use,
    /// never the configured default key.
    fn lab_key_names(&self, lab: &Lab) -> BTreeSet<String> {
        let prefix = format!("{}-", lab.name);
        let default_key = self.settings.default_key_name.as_deref();
        let mut keys: BTreeSet<String> = lab
            .status
            .servers
            .iter()
            .flat_map(|server| server.spec.ssh_key_names.iter())
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        keys.insert(lab.admin_key_name());
        keys.retain(|key| Some(key.as_str()) != default_key);
        keys
    }
}
