//! The four remote checks making up one readiness attempt.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::remote::{RemoteCommandOutput, RemoteError, SshSession, SshTarget, SshTransport};
use crate::ttl::Clock;

/// Waits for cloud-init to finish and reports its status.
pub const CLOUD_INIT_STATUS_COMMAND: &str = "cloud-init status --wait";
/// Prints the boot time in UTC.
pub const BOOT_TIME_COMMAND: &str = "TZ=UTC uptime -s";
/// `chrono` format of [`BOOT_TIME_COMMAND`] output.
pub const BOOT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Prints `yes` while a reboot is pending.
pub const REBOOT_REQUIRED_COMMAND: &str =
    "[ -f /var/run/reboot-required ] && echo 'yes' || echo 'no'";
/// Prints `ok` once no package upgrades remain.
pub const PACKAGE_STATUS_COMMAND: &str =
    "apt-get -s upgrade | grep -q '^0 upgraded' && echo 'ok' || echo 'pending'";

/// cloud-init exit code for "done, with recoverable errors".
const CLOUD_INIT_RECOVERABLE_EXIT: i32 = 2;

/// Stage of a readiness attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckStage {
    /// Opening the SSH session.
    Connect,
    /// `cloud-init status --wait`.
    CloudInit,
    /// Boot time freshness.
    BootTime,
    /// Reboot-required marker.
    RebootMarker,
    /// Pending package upgrades.
    Packages,
}

impl fmt::Display for CheckStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "ssh connection",
            Self::CloudInit => "cloud-init status",
            Self::BootTime => "boot time",
            Self::RebootMarker => "reboot marker",
            Self::Packages => "package status",
        })
    }
}

/// Why a single readiness attempt did not pass.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CheckFailure {
    /// The session could not be opened or a command could not be delivered.
    #[error("{stage} failed: {source}")]
    Remote {
        /// Stage that failed.
        stage: CheckStage,
        /// Transport failure.
        #[source]
        source: RemoteError,
    },
    /// A command exited with an unexpected status.
    #[error("{stage} command exited with status {status_text}")]
    CommandFailed {
        /// Stage that failed.
        stage: CheckStage,
        /// Human readable exit status.
        status_text: String,
    },
    /// cloud-init has not reported `done`.
    #[error("cloud-init not done yet: {status}")]
    CloudInitPending {
        /// Trimmed status output.
        status: String,
    },
    /// `uptime -s` output could not be parsed.
    #[error("unparsable boot time `{output}`")]
    BootTimeUnparsable {
        /// Trimmed command output.
        output: String,
    },
    /// The server booted too long ago to have applied its upgrades.
    #[error("boot time {boot_time} is older than {window_secs}s")]
    StaleBoot {
        /// Reported boot time.
        boot_time: DateTime<Utc>,
        /// Accepted window in seconds.
        window_secs: i64,
    },
    /// `/var/run/reboot-required` is still present.
    #[error("reboot still required")]
    RebootRequired,
    /// Package upgrades are still pending.
    #[error("packages still need upgrading: {status}")]
    PackagesPending {
        /// Trimmed status output.
        status: String,
    },
}

impl CheckFailure {
    /// Stage the attempt stopped at.
    #[must_use]
    pub const fn stage(&self) -> CheckStage {
        match self {
            Self::Remote { stage, .. } | Self::CommandFailed { stage, .. } => *stage,
            Self::CloudInitPending { .. } => CheckStage::CloudInit,
            Self::BootTimeUnparsable { .. } | Self::StaleBoot { .. } => CheckStage::BootTime,
            Self::RebootRequired => CheckStage::RebootMarker,
            Self::PackagesPending { .. } => CheckStage::Packages,
        }
    }
}

fn exec(
    session: &mut dyn SshSession,
    stage: CheckStage,
    command: &str,
) -> Result<RemoteCommandOutput, CheckFailure> {
    session
        .exec(command)
        .map_err(|source| CheckFailure::Remote { stage, source })
}

fn require_success(stage: CheckStage, output: &RemoteCommandOutput) -> Result<(), CheckFailure> {
    if output.exit_code == Some(0) {
        return Ok(());
    }
    Err(CheckFailure::CommandFailed {
        stage,
        status_text: output
            .exit_code
            .map_or_else(|| String::from("unknown"), |code| code.to_string()),
    })
}

/// Runs every check over one fresh connection, returning the boot time when
/// all of them pass.
///
/// # Errors
///
/// Returns the first [`CheckFailure`]; later checks are not attempted.
pub fn run_checks(
    transport: &dyn SshTransport,
    target: &SshTarget,
    clock: &dyn Clock,
    boot_window: TimeDelta,
) -> Result<DateTime<Utc>, CheckFailure> {
    let mut session = transport
        .connect(target)
        .map_err(|source| CheckFailure::Remote {
            stage: CheckStage::Connect,
            source,
        })?;

    let cloud_init = exec(session.as_mut(), CheckStage::CloudInit, CLOUD_INIT_STATUS_COMMAND)?;
    if !matches!(cloud_init.exit_code, Some(0 | CLOUD_INIT_RECOVERABLE_EXIT)) {
        require_success(CheckStage::CloudInit, &cloud_init)?;
    }
    if !cloud_init.stdout.contains("done") {
        return Err(CheckFailure::CloudInitPending {
            status: cloud_init.trimmed_stdout().to_owned(),
        });
    }

    let uptime = exec(session.as_mut(), CheckStage::BootTime, BOOT_TIME_COMMAND)?;
    require_success(CheckStage::BootTime, &uptime)?;
    let boot_time = NaiveDateTime::parse_from_str(uptime.trimmed_stdout(), BOOT_TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| CheckFailure::BootTimeUnparsable {
            output: uptime.trimmed_stdout().to_owned(),
        })?;
    if clock.now().signed_duration_since(boot_time) > boot_window {
        return Err(CheckFailure::StaleBoot {
            boot_time,
            window_secs: boot_window.num_seconds(),
        });
    }

    let reboot = exec(session.as_mut(), CheckStage::RebootMarker, REBOOT_REQUIRED_COMMAND)?;
    require_success(CheckStage::RebootMarker, &reboot)?;
    if reboot.trimmed_stdout() == "yes" {
        return Err(CheckFailure::RebootRequired);
    }

    let packages = exec(session.as_mut(), CheckStage::Packages, PACKAGE_STATUS_COMMAND)?;
    require_success(CheckStage::Packages, &packages)?;
    if packages.trimmed_stdout() != "ok" {
        return Err(CheckFailure::PackagesPending {
            status: packages.trimmed_stdout().to_owned(),
        });
    }

    Ok(boot_time)
}
