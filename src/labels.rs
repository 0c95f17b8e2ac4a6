//! Label keys, value sanitising and label selectors.
//!
//! Labels are the join key between a lab and its resources on the backend:
//! every key, server and volume carries `lab_name`, so a lab can be rebuilt
//! from the backend even when the local cache has no record of it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Label naming the lab a resource belongs to.
pub const LAB_NAME: &str = "lab_name";
/// Label carrying the encoded `delete_after` instant.
pub const DELETE_AFTER: &str = "delete_after";
/// Label naming the operator who created the resource.
pub const OWNER: &str = "owner";
/// Label naming the operator's organization.
pub const ORGANIZATION: &str = "organization";
/// Label carrying the operator's (sanitised) email address.
pub const EMAIL: &str = "email";

/// Ordered label map attached to labs and resources.
pub type Labels = BTreeMap<String, String>;

/// Strips characters backends reject in label values.
///
/// Only ASCII letters, digits, `-` and `_` survive, and the value may not
/// start or end with `-` or `_`.
#[must_use]
pub fn sanitize_value(value: &str) -> String {
    let kept: String = value
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
        .collect();
    kept.trim_matches(|ch| matches!(ch, '-' | '_')).to_owned()
}

/// Merges two label maps; keys in `overrides` win.
#[must_use]
pub fn merge_labels(base: &Labels, overrides: &Labels) -> Labels {
    let mut merged = base.clone();
    merged.extend(
        overrides
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    merged
}

/// Errors raised while parsing a label selector.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LabelError {
    /// Raised when a selector term is not of the form `key=value`.
    #[error("malformed label selector term `{term}`: expected key=value")]
    MalformedTerm {
        /// Offending selector term.
        term: String,
    },
    /// Raised when the selector has no terms at all.
    #[error("label selector must not be empty")]
    Empty,
}

/// Equality-based label selector such as `lab_name=demo,owner=alice`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LabelSelector {
    requirements: Vec<(String, String)>,
}

impl LabelSelector {
    /// Selector matching every resource of the named lab.
    #[must_use]
    pub fn for_lab(lab: &str) -> Self {
        Self {
            requirements: vec![(LAB_NAME.to_owned(), lab.to_owned())],
        }
    }

    /// Adds an equality requirement.
    #[must_use]
    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push((key.into(), value.into()));
        self
    }

    /// Returns `true` when every requirement is satisfied by `labels`.
    #[must_use]
    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }

    /// Returns the value required for `key`, if any.
    #[must_use]
    pub fn requirement(&self, key: &str) -> Option<&str> {
        self.requirements
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }
}

impl FromStr for LabelSelector {
    type Err = LabelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut requirements = Vec::new();
        for term in raw.split(',').map(str::trim).filter(|term| !term.is_empty()) {
            let Some((key, value)) = term.split_once('=') else {
                return Err(LabelError::MalformedTerm {
                    term: term.to_owned(),
                });
            };
            let key_trimmed = key.trim();
            if key_trimmed.is_empty() {
                return Err(LabelError::MalformedTerm {
                    term: term.to_owned(),
                });
            }
            requirements.push((key_trimmed.to_owned(), value.trim().to_owned()));
        }
        if requirements.is_empty() {
            return Err(LabelError::Empty);
        }
        Ok(Self { requirements })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (key, value)) in self.requirements.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}
