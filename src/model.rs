//! Lab and resource records.
//!
//! Every record is split into a desired `spec` and an observed `status`, and
//! serialises with `serde` so the local store can snapshot whole labs.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::BackendError;
use crate::labels::{self, LabelSelector, Labels};

/// Builds the deterministic name of a lab child resource (`{lab}-{child}`).
#[must_use]
pub fn child_name(lab: &str, child: &str) -> String {
    format!("{lab}-{child}")
}

/// Name of the per-lab admin SSH key (`{lab}-admin`).
#[must_use]
pub fn admin_key_name(lab: &str) -> String {
    child_name(lab, "admin")
}

/// A named composite of servers, volumes and SSH keys.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Lab {
    /// Lab name; prefix of every child resource.
    pub name: String,
    /// Labels stamped onto the lab and propagated to its resources.
    #[serde(default)]
    pub labels: Labels,
    /// Desired shape of the lab.
    #[serde(default)]
    pub spec: LabSpec,
    /// Last observed state of the lab.
    #[serde(default)]
    pub status: LabStatus,
}

impl Lab {
    /// Creates an empty lab with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Name of the lab resource built from `child`.
    #[must_use]
    pub fn child_name(&self, child: &str) -> String {
        child_name(&self.name, child)
    }

    /// Name of this lab's admin SSH key.
    #[must_use]
    pub fn admin_key_name(&self) -> String {
        admin_key_name(&self.name)
    }

    /// Selector matching every backend resource of this lab.
    #[must_use]
    pub fn selector(&self) -> LabelSelector {
        LabelSelector::for_lab(&self.name)
    }
}

/// Desired shape of a lab.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct LabSpec {
    /// Backend identifier (for example `hetzner`).
    pub provider: String,
    /// Backend location (for example `nbg1`).
    pub location: String,
    /// Lifetime of every lab resource, such as `2h`.
    pub ttl: String,
    /// Servers in creation order.
    pub servers: Vec<LabServer>,
    /// Volumes in creation order.
    pub volumes: Vec<LabVolume>,
}

/// Server entry of a lab spec.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct LabServer {
    /// Short name; the backend name is `{lab}-{name}`.
    pub name: String,
    /// Backend-specific server type.
    #[serde(rename = "type")]
    pub server_type: String,
    /// Image to boot.
    pub image: String,
}

/// Volume entry of a lab spec.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct LabVolume {
    /// Short name; the backend name is `{lab}-{name}`.
    pub name: String,
    /// Short name of the lab server the volume attaches to.
    #[serde(default)]
    pub server: Option<String>,
    /// Size in gigabytes.
    pub size: u32,
    /// Whether the backend should mount the volume; defaults to `false`.
    #[serde(default)]
    pub automount: Option<bool>,
    /// Filesystem to format with; defaults to `xfs`.
    #[serde(default)]
    pub format: Option<String>,
}

/// Observed state of a lab.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct LabStatus {
    /// Aggregate state, taken from the first server.
    pub state: String,
    /// Owner label of the lab.
    pub owner: String,
    /// Creation time.
    pub created: Option<DateTime<Utc>>,
    /// Instant after which the lab may be deleted without forcing.
    pub delete_after: Option<DateTime<Utc>>,
    /// Servers as reported by the backend.
    pub servers: Vec<Server>,
    /// Volumes as reported by the backend.
    pub volumes: Vec<Volume>,
}

/// A compute instance.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Server {
    /// Backend name (`{lab}-{short}`).
    pub name: String,
    /// Labels, including `lab_name` and `delete_after`.
    #[serde(default)]
    pub labels: Labels,
    /// Desired configuration.
    #[serde(default)]
    pub spec: ServerSpec,
    /// Observed state.
    #[serde(default)]
    pub status: ServerStatus,
}

impl Server {
    /// Name of the lab this server belongs to, from its `lab_name` label.
    #[must_use]
    pub fn lab_name(&self) -> Option<&str> {
        self.labels.get(labels::LAB_NAME).map(String::as_str)
    }
}

/// Desired configuration of a server.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ServerSpec {
    /// Backend-specific server type.
    pub server_type: String,
    /// Boot image.
    pub image: String,
    /// Backend location.
    pub location: String,
    /// Backend identifier.
    pub provider: String,
    /// SSH keys installed at creation.
    pub ssh_key_names: Vec<String>,
    /// Lifetime, such as `2h`.
    pub ttl: String,
}

/// Observed state of a server.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ServerStatus {
    /// Backend state string (for example `running`).
    pub state: String,
    /// Owner label.
    pub owner: String,
    /// Virtual CPU count.
    pub cores: u32,
    /// Memory in megabytes.
    pub memory_mb: u64,
    /// Disk size in gigabytes.
    pub disk_gb: u32,
    /// Public addresses.
    pub public_net: PublicNet,
    /// Creation time.
    pub created: Option<DateTime<Utc>>,
    /// Instant after which the server may be deleted without forcing.
    pub delete_after: Option<DateTime<Utc>>,
}

/// Public network details of a server.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct PublicNet {
    /// Primary IPv4 address.
    pub ipv4: Option<IpAddr>,
    /// IPv6 address or network.
    pub ipv6: Option<String>,
    /// DNS name published for the server.
    pub fqdn: Option<String>,
}

impl PublicNet {
    /// Host to connect to: the IPv4 address, else the DNS name.
    #[must_use]
    pub fn ssh_host(&self) -> Option<String> {
        self.ipv4
            .map(|address| address.to_string())
            .or_else(|| self.fqdn.clone())
    }
}

/// A block volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Volume {
    /// Backend name (`{lab}-{short}`).
    pub name: String,
    /// Labels, including `lab_name` and `delete_after`.
    #[serde(default)]
    pub labels: Labels,
    /// Desired configuration.
    #[serde(default)]
    pub spec: VolumeSpec,
    /// Observed state.
    #[serde(default)]
    pub status: VolumeStatus,
}

/// Desired configuration of a volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct VolumeSpec {
    /// Size in gigabytes.
    pub size_gb: u32,
    /// Backend name of the server the volume attaches to.
    pub server_name: Option<String>,
    /// Whether the backend mounts the volume.
    pub automount: bool,
    /// Filesystem format.
    pub format: String,
    /// Backend location.
    pub location: String,
    /// Backend identifier.
    pub provider: String,
    /// Lifetime, such as `2h`.
    pub ttl: String,
}

/// Observed state of a volume.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct VolumeStatus {
    /// Backend state string.
    pub state: String,
    /// Owner label.
    pub owner: String,
    /// Creation time.
    pub created: Option<DateTime<Utc>>,
    /// Instant after which the volume may be deleted without forcing.
    pub delete_after: Option<DateTime<Utc>>,
}

/// A named SSH key registered with the backend.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SshKey {
    /// Key name.
    pub name: String,
    /// Labels, including `lab_name` for per-lab keys.
    #[serde(default)]
    pub labels: Labels,
    /// OpenSSH public key line.
    pub public_key: String,
    /// Lifetime, such as `2h`.
    #[serde(default)]
    pub ttl: String,
    /// Creation time.
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    /// Instant after which the key may be deleted without forcing.
    #[serde(default)]
    pub delete_after: Option<DateTime<Utc>>,
}

/// Kind of backend resource.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResourceKind {
    /// Compute instance.
    Server,
    /// Block volume.
    Volume,
    /// SSH key.
    SshKey,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "server",
            Self::Volume => "volume",
            Self::SshKey => "ssh key",
        })
    }
}

/// Outcome of a delete attempt.
///
/// A deferred deletion is a normal result carrying the instant the resource
/// becomes eligible, not an error.
#[must_use]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeleteStatus {
    /// The resource was removed.
    Deleted,
    /// Deletion was refused because the resource's TTL has not elapsed.
    Deferred {
        /// Instant from which deletion is allowed.
        delete_after: DateTime<Utc>,
    },
    /// The backend failed to delete the resource.
    Failed {
        /// Backend failure.
        error: BackendError,
    },
}

impl DeleteStatus {
    /// Returns `true` when the resource was removed.
    pub const fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Returns the eligibility instant of a deferred deletion.
    pub const fn delete_after(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Deferred { delete_after } => Some(*delete_after),
            Self::Deleted | Self::Failed { .. } => None,
        }
    }

    /// Returns the backend failure, if any.
    pub const fn error(&self) -> Option<&BackendError> {
        match self {
            Self::Failed { error } => Some(error),
            Self::Deleted | Self::Deferred { .. } => None,
        }
    }
}

impl fmt::Display for DeleteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deleted => f.write_str("deleted"),
            Self::Deferred { delete_after } => {
                write!(f, "not ready for deletion until {delete_after}")
            }
            Self::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn child_names_are_prefixed_with_the_lab() {
        let lab = Lab::new("demo");
        assert_eq!(lab.child_name("node-01"), "demo-node-01");
        assert_eq!(lab.admin_key_name(), "demo-admin");
        assert_eq!(lab.selector().to_string(), "lab_name=demo");
    }

    #[test]
    fn lab_spec_reads_template_style_field_names() {
        let spec: LabSpec = serde_json::from_str(
            r#"{"ttl":"2h","servers":[{"name":"cp","type":"cx22","image":"ubuntu-24.04"}],
                "volumes":[{"name":"volume-01","server":"cp","size":100}]}"#,
        )
        .expect("spec should deserialise");

        assert_eq!(spec.servers.first().map(|s| s.server_type.as_str()), Some("cx22"));
        let volume = spec.volumes.first().expect("one volume");
        assert_eq!(volume.server.as_deref(), Some("cp"));
        assert_eq!(volume.automount, None);
        assert!(spec.provider.is_empty());
    }

    #[test]
    fn ssh_host_prefers_ipv4_over_fqdn() {
        let mut net = PublicNet {
            ipv4: None,
            ipv6: None,
            fqdn: Some(String::from("cp.demo.example")),
        };
        assert_eq!(net.ssh_host().as_deref(), Some("cp.demo.example"));

        net.ipv4 = Some(IpAddr::from([192, 0, 2, 10]));
        assert_eq!(net.ssh_host().as_deref(), Some("192.0.2.10"));
    }

    #[test]
    fn delete_status_accessors_expose_each_outcome() {
        let eligible = Utc
            .with_ymd_and_hms(2026, 10, 16, 12, 0, 0)
            .single()
            .expect("timestamp");
        let deferred = DeleteStatus::Deferred {
            delete_after: eligible,
        };
        assert!(!deferred.is_deleted());
        assert_eq!(deferred.delete_after(), Some(eligible));

        let failed = DeleteStatus::Failed {
            error: BackendError::Provider {
                message: String::from("boom"),
            },
        };
        assert!(failed.error().is_some());
        assert!(DeleteStatus::Deleted.is_deleted());
    }
}
