//! YAML lab templates.
//!
//! A template describes the shape of a lab (servers, volumes, ttl, backend
//! and location) under a Kubernetes-style envelope. Resolving it gives the
//! fully specified [`Lab`] that [`crate::lab::LabOrchestrator::create`]
//! expects.

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::labels::Labels;
use crate::model::{Lab, LabSpec};

/// `kind` every lab template must declare.
pub const LAB_KIND: &str = "Lab";

/// Built-in template used when no template file is given.
pub const DEFAULT_LAB_TEMPLATE: &str = r"apiVersion: v1
kind: Lab
metadata:
  name: aistor-lab
  labels:
    project: aistor
spec:
  ttl: 24h
  provider: hetzner
  location: nbg1
  servers:
  - name: cp
    type: cx22
    image: ubuntu-24.04
  - name: node-01
    type: cx22
    image: ubuntu-24.04
  volumes:
  - name: volume-01
    server: node-01
    size: 100
    automount: false
    format: xfs
  - name: volume-02
    server: node-01
    size: 100
    automount: false
    format: xfs
  - name: volume-03
    server: node-01
    size: 100
    automount: false
    format: xfs
  - name: volume-04
    server: node-01
    size: 100
    automount: false
    format: xfs
";

/// Errors raised while loading or resolving a template.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TemplateError {
    /// Raised when the template file cannot be read.
    #[error("failed to read lab template {path}: {message}")]
    Read {
        /// Template path.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the document is not valid template YAML.
    #[error("failed to parse lab template: {0}")]
    Parse(String),
    /// Raised when the document declares another kind.
    #[error("lab template has kind {found:?}, expected \"Lab\"")]
    WrongKind {
        /// Kind found in the document.
        found: String,
    },
    /// Raised when no lab name is supplied.
    #[error("lab name must not be empty")]
    EmptyName,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabTemplate {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: TemplateMetadata,
    #[serde(default)]
    spec: LabSpec,
}

#[derive(Debug, Default, Deserialize)]
struct TemplateMetadata {
    #[serde(default)]
    labels: Labels,
}

/// Values that replace the template's own when set.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TemplateOverrides {
    /// Backend identifier.
    pub provider: Option<String>,
    /// Backend location.
    pub location: Option<String>,
    /// Lab lifetime, such as `2h`.
    pub ttl: Option<String>,
}

fn apply(target: &mut String, value: Option<&String>) {
    if let Some(text) = value
        && !text.trim().is_empty()
    {
        text.trim().clone_into(target);
    }
}

/// Resolves the template document `yaml` into a lab named `name`.
///
/// The template's metadata name is ignored; its labels are copied onto the
/// lab.
///
/// # Errors
///
/// Returns [`TemplateError`] when the name is blank, the YAML is invalid or
/// the document is not a `Lab`.
pub fn lab_from_template(
    yaml: &str,
    name: &str,
    overrides: &TemplateOverrides,
) -> Result<Lab, TemplateError> {
    let lab_name = name.trim();
    if lab_name.is_empty() {
        return Err(TemplateError::EmptyName);
    }
    let template: LabTemplate =
        serde_yaml::from_str(yaml).map_err(|err| TemplateError::Parse(err.to_string()))?;
    if template.kind != LAB_KIND {
        return Err(TemplateError::WrongKind {
            found: template.kind,
        });
    }
    debug!(
        api_version = %template.api_version,
        lab = %lab_name,
        servers = template.spec.servers.len(),
        volumes = template.spec.volumes.len(),
        "resolved lab template"
    );

    let mut spec = template.spec;
    apply(&mut spec.provider, overrides.provider.as_ref());
    apply(&mut spec.location, overrides.location.as_ref());
    apply(&mut spec.ttl, overrides.ttl.as_ref());

    Ok(Lab {
        labels: template.metadata.labels,
        spec,
        ..Lab::new(lab_name)
    })
}

/// Reads a template file and resolves it like [`lab_from_template`].
///
/// # Errors
///
/// Returns [`TemplateError::Read`] when the file cannot be read, otherwise
/// the errors of [`lab_from_template`].
pub fn load_template(
    path: &Utf8Path,
    name: &str,
    overrides: &TemplateOverrides,
) -> Result<Lab, TemplateError> {
    let read_error = |message: String| TemplateError::Read {
        path: path.to_string(),
        message,
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| read_error(String::from("path has no file name")))?;
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| read_error(err.to_string()))?;
    let yaml = dir
        .read_to_string(file_name)
        .map_err(|err| read_error(err.to_string()))?;
    lab_from_template(&yaml, name, overrides)
}
