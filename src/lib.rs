//! Core library for the labrat lab orchestrator.
//!
//! A lab is a named, time-boxed bundle of servers, volumes and SSH keys
//! created together on one infrastructure backend. [`LabOrchestrator`] creates
//! labs (keys → servers → SSH readiness → volumes), answers lookups from a
//! local [`LabStore`] cache rebuilt from backend labels, and tears labs down
//! once their `delete_after` label has passed.
//!
//! Concrete provider adapters implement [`Backend`]; [`MemoryBackend`] is the
//! in-process reference implementation used by tests and demos.

pub mod backend;
pub mod cloud_init;
pub mod config;
pub mod keys;
pub mod lab;
pub mod labels;
pub mod model;
pub mod readiness;
pub mod remote;
pub mod store;
pub mod template;
pub mod test_support;
pub mod ttl;

pub use backend::memory::MemoryBackend;
pub use backend::{Backend, BackendError, ServerRequest, SshKeyRequest, VolumeRequest};
pub use config::{ConfigError, LabConfig};
pub use keys::{KeyError, KeyStore, LocalKeyStore};
pub use lab::{
    LabDeletion, LabError, LabOrchestrator, LabSettings, ReapSummary, ResourceDeletion,
};
pub use labels::{LabelError, LabelSelector, Labels};
pub use model::{
    DeleteStatus, Lab, LabServer, LabSpec, LabStatus, LabVolume, ResourceKind, Server, SshKey,
    Volume,
};
pub use readiness::{ReadinessChecker, ReadinessConfig, ReadinessError, ReadinessReport};
pub use remote::{
    CommandOutput, CommandRunner, ProcessCommandRunner, ProcessSshTransport, RemoteError,
    SshTarget, SshTransport,
};
pub use store::{LabStore, StoreError};
pub use template::{DEFAULT_LAB_TEMPLATE, TemplateError, TemplateOverrides, lab_from_template};
pub use ttl::{Clock, SystemClock, TtlError};
