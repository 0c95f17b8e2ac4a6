//! Operator settings: label identity, lab defaults, SSH and readiness
//! tuning, and where local state lives.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::readiness::ReadinessConfig;
use crate::remote::expand_tilde;
use crate::ttl::parse_ttl;

/// Placeholder owner label used until the operator configures one.
pub const NO_OWNER: &str = "NO OWNER SET";
/// Placeholder organization label.
pub const NO_ORGANIZATION: &str = "NO ORGANIZATION SET";
/// Placeholder email label.
pub const NO_EMAIL: &str = "NO EMAIL SET";

/// Settings shared by every lab operation, layered from defaults,
/// `labrat.toml`, `LABRAT_*` environment variables and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "LABRAT",
    discovery(
        app_name = "labrat",
        env_var = "LABRAT_CONFIG_PATH",
        config_file_name = "labrat.toml",
        dotfile_name = ".labrat.toml",
        project_file_name = "labrat.toml"
    )
)]
pub struct LabConfig {
    /// Location of the redb cache file. Supports `~/`.
    #[ortho_config(default = "~/.labrat/labrat.redb".to_owned())]
    pub state_path: String,
    /// Table holding lab records.
    #[ortho_config(default = "labs".to_owned())]
    pub state_table: String,
    /// Directory for per-lab admin key pairs. Supports `~/`.
    #[ortho_config(default = "~/.labrat/keys".to_owned())]
    pub keys_dir: String,
    /// Owner label stamped onto every resource.
    #[ortho_config(default = NO_OWNER.to_owned())]
    pub owner: String,
    /// Organization label stamped onto every resource.
    #[ortho_config(default = NO_ORGANIZATION.to_owned())]
    pub organization: String,
    /// Email label stamped onto every resource.
    #[ortho_config(default = NO_EMAIL.to_owned())]
    pub email: String,
    /// Backend used when a template names none.
    #[ortho_config(default = "hetzner".to_owned())]
    pub default_provider: String,
    /// Location used when a template names none.
    #[ortho_config(default = "nbg1".to_owned())]
    pub default_location: String,
    /// Lifetime applied when a lab has no ttl.
    #[ortho_config(default = "1h".to_owned())]
    pub default_ttl: String,
    /// Long-lived provider key attached to every server when present.
    pub default_key_name: Option<String>,
    /// Login created by cloud-init and used by readiness checks.
    #[ortho_config(default = "ansible".to_owned())]
    pub admin_user: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `ssh-keygen` executable.
    #[ortho_config(default = "ssh-keygen".to_owned())]
    pub ssh_keygen_bin: String,
    /// SSH port of lab servers.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Overall budget for one readiness batch, in seconds.
    #[ortho_config(default = 1800)]
    pub readiness_timeout_secs: u64,
    /// Readiness attempts per server.
    #[ortho_config(default = 20)]
    pub readiness_max_attempts: u32,
    /// Pause between readiness attempts, in seconds.
    #[ortho_config(default = 30)]
    pub readiness_tick_secs: u64,
    /// Filesystem used for volumes that do not name one.
    #[ortho_config(default = "xfs".to_owned())]
    pub volume_format: String,
    /// Whether volumes that do not say otherwise are mounted by the backend.
    #[ortho_config(default = false)]
    pub volume_automount: bool,
}

/// Where a setting comes from, for error messages that say how to fix it.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to labrat.toml",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::InvalidValue(format!(
            "invalid {} ({}): {reason}",
            self.description, self.toml_key
        ))
    }
}

const DEFAULT_TTL_FIELD: FieldMetadata =
    FieldMetadata::new("default ttl", "LABRAT_DEFAULT_TTL", "default_ttl");
const DEFAULT_KEY_FIELD: FieldMetadata =
    FieldMetadata::new("default key name", "LABRAT_DEFAULT_KEY_NAME", "default_key_name");
const MAX_ATTEMPTS_FIELD: FieldMetadata = FieldMetadata::new(
    "readiness attempt count",
    "LABRAT_READINESS_MAX_ATTEMPTS",
    "readiness_max_attempts",
);
const TIMEOUT_FIELD: FieldMetadata = FieldMetadata::new(
    "readiness timeout",
    "LABRAT_READINESS_TIMEOUT_SECS",
    "readiness_timeout_secs",
);
const TICK_FIELD: FieldMetadata = FieldMetadata::new(
    "readiness tick",
    "LABRAT_READINESS_TICK_SECS",
    "readiness_tick_secs",
);

impl LabConfig {
    /// Merges built-in defaults, `labrat.toml`, `LABRAT_*` variables and the
    /// process arguments, later layers winning.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when a layer cannot be read or merged.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Like [`LabConfig::load_from_sources`] but ignores the process
    /// arguments, for embedding in binaries with their own CLI.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when a layer cannot be read or merged.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("labrat")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required value is blank
    /// and [`ConfigError::InvalidValue`] when a value cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, metadata) in self.required_fields() {
            if value.trim().is_empty() {
                return Err(metadata.missing());
            }
        }
        if self
            .default_key_name
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            return Err(DEFAULT_KEY_FIELD.missing());
        }
        if self.default_ttl.trim().is_empty() {
            return Err(DEFAULT_TTL_FIELD.missing());
        }
        parse_ttl(&self.default_ttl).map_err(|err| DEFAULT_TTL_FIELD.invalid(&err.to_string()))?;
        if self.readiness_timeout_secs == 0 {
            return Err(TIMEOUT_FIELD.invalid("must be at least 1 second"));
        }
        if self.readiness_max_attempts == 0 {
            return Err(MAX_ATTEMPTS_FIELD.invalid("must be at least 1"));
        }
        if self.readiness_tick_secs == 0 {
            return Err(TICK_FIELD.invalid("must be at least 1 second"));
        }
        Ok(())
    }

    fn required_fields(&self) -> [(&str, FieldMetadata); 12] {
        [
            (
                self.state_path.as_str(),
                FieldMetadata::new("state store path", "LABRAT_STATE_PATH", "state_path"),
            ),
            (
                self.state_table.as_str(),
                FieldMetadata::new("state table name", "LABRAT_STATE_TABLE", "state_table"),
            ),
            (
                self.keys_dir.as_str(),
                FieldMetadata::new("keys directory", "LABRAT_KEYS_DIR", "keys_dir"),
            ),
            (
                self.owner.as_str(),
                FieldMetadata::new("owner label", "LABRAT_OWNER", "owner"),
            ),
            (
                self.organization.as_str(),
                FieldMetadata::new("organization label", "LABRAT_ORGANIZATION", "organization"),
            ),
            (
                self.email.as_str(),
                FieldMetadata::new("email label", "LABRAT_EMAIL", "email"),
            ),
            (
                self.default_provider.as_str(),
                FieldMetadata::new("default provider", "LABRAT_DEFAULT_PROVIDER", "default_provider"),
            ),
            (
                self.default_location.as_str(),
                FieldMetadata::new("default location", "LABRAT_DEFAULT_LOCATION", "default_location"),
            ),
            (
                self.admin_user.as_str(),
                FieldMetadata::new("admin user", "LABRAT_ADMIN_USER", "admin_user"),
            ),
            (
                self.ssh_bin.as_str(),
                FieldMetadata::new("ssh binary", "LABRAT_SSH_BIN", "ssh_bin"),
            ),
            (
                self.ssh_keygen_bin.as_str(),
                FieldMetadata::new("ssh-keygen binary", "LABRAT_SSH_KEYGEN_BIN", "ssh_keygen_bin"),
            ),
            (
                self.volume_format.as_str(),
                FieldMetadata::new("volume format", "LABRAT_VOLUME_FORMAT", "volume_format"),
            ),
        ]
    }

    /// Readiness polling parameters derived from this configuration.
    #[must_use]
    pub fn readiness(&self) -> ReadinessConfig {
        ReadinessConfig {
            timeout: Duration::from_secs(self.readiness_timeout_secs),
            max_attempts: self.readiness_max_attempts,
            tick: Duration::from_secs(self.readiness_tick_secs),
            user: self.admin_user.trim().to_owned(),
            port: self.ssh_port,
            ..ReadinessConfig::default()
        }
    }

    /// Cache file path with `~/` expanded.
    #[must_use]
    pub fn state_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(self.state_path.trim()))
    }

    /// Keys directory with `~/` expanded.
    #[must_use]
    pub fn keys_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(self.keys_dir.trim()))
    }

    /// The configured default key name, ignoring blank values.
    #[must_use]
    pub fn default_key_name(&self) -> Option<&str> {
        self.default_key_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

/// Why a configuration could not be loaded or used.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A required value is blank.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A value is set but unusable.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// The layered loader failed.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;
    use rstest::{fixture, rstest};

    #[fixture]
    fn base_config() -> LabConfig {
        LabConfig {
            state_path: String::from("/var/lib/labrat/labrat.redb"),
            state_table: String::from("labs"),
            keys_dir: String::from("/var/lib/labrat/keys"),
            owner: String::from("ops"),
            organization: String::from("acme"),
            email: String::from("ops@example.com"),
            default_provider: String::from("hetzner"),
            default_location: String::from("nbg1"),
            default_ttl: String::from("1h"),
            default_key_name: None,
            admin_user: String::from("ansible"),
            ssh_bin: String::from("ssh"),
            ssh_keygen_bin: String::from("ssh-keygen"),
            ssh_port: 22,
            readiness_timeout_secs: 1800,
            readiness_max_attempts: 20,
            readiness_tick_secs: 30,
            volume_format: String::from("xfs"),
            volume_automount: false,
        }
    }

    #[rstest]
    fn validate_accepts_complete_config(base_config: LabConfig) {
        assert_eq!(base_config.validate(), Ok(()));
    }

    #[rstest]
    #[case::owner(|cfg: &mut LabConfig| cfg.owner.clear(), "LABRAT_OWNER")]
    #[case::keys_dir(|cfg: &mut LabConfig| cfg.keys_dir = String::from("  "), "LABRAT_KEYS_DIR")]
    #[case::admin_user(|cfg: &mut LabConfig| cfg.admin_user.clear(), "LABRAT_ADMIN_USER")]
    #[case::default_key(
        |cfg: &mut LabConfig| cfg.default_key_name = Some(String::from(" ")),
        "LABRAT_DEFAULT_KEY_NAME"
    )]
    fn missing_fields_name_their_env_var(
        base_config: LabConfig,
        #[case] clear: fn(&mut LabConfig),
        #[case] env_var: &str,
    ) {
        let mut cfg = base_config;
        clear(&mut cfg);

        let err = cfg.validate().expect_err("blank value should fail");

        let message = err.to_string();
        assert!(matches!(err, ConfigError::MissingField(_)), "got {err:?}");
        assert!(message.contains(env_var), "message should name {env_var}: {message}");
        assert!(message.contains("labrat.toml"), "message should name the file: {message}");
    }

    #[rstest]
    #[case::ttl(|cfg: &mut LabConfig| cfg.default_ttl = String::from("soon"), "default_ttl")]
    #[case::timeout(|cfg: &mut LabConfig| cfg.readiness_timeout_secs = 0, "readiness_timeout_secs")]
    #[case::attempts(|cfg: &mut LabConfig| cfg.readiness_max_attempts = 0, "readiness_max_attempts")]
    #[case::tick(|cfg: &mut LabConfig| cfg.readiness_tick_secs = 0, "readiness_tick_secs")]
    fn unusable_values_are_rejected(
        base_config: LabConfig,
        #[case] corrupt: fn(&mut LabConfig),
        #[case] key: &str,
    ) {
        let mut cfg = base_config;
        corrupt(&mut cfg);

        let err = cfg.validate().expect_err("invalid value should fail");

        assert!(matches!(err, ConfigError::InvalidValue(_)), "got {err:?}");
        assert!(err.to_string().contains(key));
    }

    #[rstest]
    fn readiness_settings_follow_the_config(base_config: LabConfig) {
        let cfg = LabConfig {
            readiness_timeout_secs: 60,
            readiness_max_attempts: 4,
            readiness_tick_secs: 5,
            ssh_port: 2222,
            ..base_config
        };

        let readiness = cfg.readiness();

        assert_eq!(readiness.timeout, Duration::from_secs(60));
        assert_eq!(readiness.max_attempts, 4);
        assert_eq!(readiness.tick, Duration::from_secs(5));
        assert_eq!(readiness.user, "ansible");
        assert_eq!(readiness.port, 2222);
    }

    #[rstest]
    fn default_key_name_ignores_blank_values(base_config: LabConfig) {
        let cfg = LabConfig {
            default_key_name: Some(String::from("  ops-key ")),
            ..base_config
        };
        assert_eq!(cfg.default_key_name(), Some("ops-key"));
    }

    #[tokio::test]
    async fn defaults_and_environment_are_layered() {
        let _guard = EnvGuard::set_vars(&[
            ("HOME", "/home/labrat"),
            ("LABRAT_OWNER", "platform"),
            ("LABRAT_READINESS_MAX_ATTEMPTS", "7"),
        ])
        .await;

        let cfg = LabConfig::load_without_cli_args().expect("config loads");

        assert_eq!(cfg.owner, "platform");
        assert_eq!(cfg.readiness_max_attempts, 7);
        assert_eq!(cfg.default_ttl, "1h");
        assert_eq!(cfg.volume_format, "xfs");
        assert!(!cfg.volume_automount);
        assert_eq!(cfg.state_path(), Utf8PathBuf::from("/home/labrat/.labrat/labrat.redb"));
        assert_eq!(cfg.keys_dir(), Utf8PathBuf::from("/home/labrat/.labrat/keys"));
    }
}
