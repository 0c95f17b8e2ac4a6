//! Cloud-init user data for lab servers.
//!
//! Every server boots with a `#cloud-config` document that creates the admin
//! user with the lab's public key, applies package upgrades, and reboots when
//! the upgrade leaves `/var/run/reboot-required` behind. The readiness checker
//! later verifies exactly those effects.

use serde::Serialize;
use thiserror::Error;

/// Marker file written by Debian-family systems when a reboot is pending.
pub const REBOOT_REQUIRED_MARKER: &str = "/var/run/reboot-required";

/// Errors raised while rendering user data.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum CloudInitError {
    /// Raised when the admin user name is blank.
    #[error("cloud-init admin user must not be empty")]
    EmptyUser,
    /// Raised when the public key is blank.
    #[error("cloud-init public key must not be empty")]
    EmptyPublicKey,
    /// Raised when the document cannot be serialised.
    #[error("failed to render cloud-init user data: {message}")]
    Render {
        /// Serialiser error string.
        message: String,
    },
}

#[derive(Serialize)]
struct CloudConfig<'a> {
    users: [CloudUser<'a>; 1],
    package_update: bool,
    package_upgrade: bool,
    power_state: PowerState,
}

#[derive(Serialize)]
struct CloudUser<'a> {
    name: &'a str,
    gecos: String,
    groups: &'static str,
    sudo: &'static str,
    shell: &'static str,
    ssh_authorized_keys: [&'a str; 1],
}

#[derive(Serialize)]
struct PowerState {
    mode: &'static str,
    message: &'static str,
    condition: String,
}

/// Renders the `#cloud-config` document for a lab server.
///
/// # Errors
///
/// Returns [`CloudInitError`] when either input is blank or serialisation
/// fails.
pub fn render_user_data(admin_user: &str, public_key: &str) -> Result<String, CloudInitError> {
    let user = admin_user.trim();
    if user.is_empty() {
        return Err(CloudInitError::EmptyUser);
    }
    let key = public_key.trim();
    if key.is_empty() {
        return Err(CloudInitError::EmptyPublicKey);
    }

    let document = CloudConfig {
        users: [CloudUser {
            name: user,
            gecos: format!("{user} admin user"),
            groups: "users,admin,wheel,sudo",
            sudo: "ALL=(ALL) NOPASSWD:ALL",
            shell: "/bin/bash",
            ssh_authorized_keys: [key],
        }],
        package_update: true,
        package_upgrade: true,
        power_state: PowerState {
            mode: "reboot",
            message: "Rebooting after package upgrades",
            condition: format!("test -f {REBOOT_REQUIRED_MARKER}"),
        },
    };
    let body = serde_yaml::to_string(&document).map_err(|err| CloudInitError::Render {
        message: err.to_string(),
    })?;
    Ok(format!("#cloud-config\n{body}"))
}
