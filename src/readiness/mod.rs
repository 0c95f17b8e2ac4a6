//! Concurrent SSH readiness checks for newly created servers.
//!
//! [`ReadinessChecker::check_servers`] spawns one worker per server. Each
//! worker opens a fresh SSH session per attempt and runs the checks in
//! [`checks`]; any failing check abandons the attempt, and the worker sleeps
//! for the tick interval before trying again. Workers stop on success, after
//! `max_attempts`, when the shared deadline passes, or on cancellation. The
//! call joins every worker before returning, so one server's failure never
//! cancels its siblings, and results keep the order of the input.
//!
//! Blocking SSH I/O runs on tokio's blocking pool. A cancelled or timed-out
//! worker returns immediately; an attempt already in flight finishes in the
//! background and its result is discarded.

pub mod checks;

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use checks::{
    BOOT_TIME_COMMAND, BOOT_TIME_FORMAT, CLOUD_INIT_STATUS_COMMAND, CheckFailure, CheckStage,
    PACKAGE_STATUS_COMMAND, REBOOT_REQUIRED_COMMAND,
};

use crate::model::Server;
use crate::remote::{SshTarget, SshTransport};
use crate::ttl::{Clock, SystemClock};

/// Overall time budget for one `check_servers` call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Attempts per server.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;
/// Pause between attempts.
pub const DEFAULT_TICK: Duration = Duration::from_secs(30);
/// Login used for readiness checks.
pub const DEFAULT_ADMIN_USER: &str = "ansible";

/// Readiness polling parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadinessConfig {
    /// Shared deadline for the whole batch.
    pub timeout: Duration,
    /// Attempts per server before giving up.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub tick: Duration,
    /// How recent the boot time must be.
    pub boot_window: TimeDelta,
    /// SSH login.
    pub user: String,
    /// SSH port.
    pub port: u16,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            tick: DEFAULT_TICK,
            boot_window: TimeDelta::minutes(5),
            user: String::from(DEFAULT_ADMIN_USER),
            port: 22,
        }
    }
}

/// Errors that end a server's readiness check.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReadinessError {
    /// The server has neither a public IPv4 address nor a DNS name.
    #[error("server {server} has no reachable address")]
    MissingAddress {
        /// Server name.
        server: String,
    },
    /// Every attempt failed.
    #[error("server {server} not ready: max attempts ({attempts}) reached; last failure: {last_failure}")]
    AttemptsExhausted {
        /// Server name.
        server: String,
        /// Attempts made.
        attempts: u32,
        /// Reason the final attempt failed.
        last_failure: String,
    },
    /// The shared deadline passed.
    #[error("server {server} not ready: timed out after {timeout:?} and {attempts} attempts")]
    Timeout {
        /// Server name.
        server: String,
        /// Attempts started before the deadline.
        attempts: u32,
        /// Budget that was exceeded.
        timeout: Duration,
    },
    /// The caller cancelled the check.
    #[error("readiness check for {server} cancelled after {attempts} attempts")]
    Cancelled {
        /// Server name.
        server: String,
        /// Attempts started before cancellation.
        attempts: u32,
    },
    /// The worker task panicked or was aborted.
    #[error("readiness worker for {server} failed: {message}")]
    Worker {
        /// Server name.
        server: String,
        /// Join error text.
        message: String,
    },
}

impl ReadinessError {
    /// Name of the server the error refers to.
    #[must_use]
    pub fn server(&self) -> &str {
        match self {
            Self::MissingAddress { server }
            | Self::AttemptsExhausted { server, .. }
            | Self::Timeout { server, .. }
            | Self::Cancelled { server, .. }
            | Self::Worker { server, .. } => server,
        }
    }
}

/// Server to check and the key that authenticates the session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadinessRequest {
    /// Server record, including its public address.
    pub server: Server,
    /// Private key of the lab's admin key pair.
    pub identity_file: Utf8PathBuf,
}

/// Details of a server that passed every check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadyServer {
    /// Attempt that succeeded, counting from one.
    pub attempts: u32,
    /// Boot time reported by the server.
    pub boot_time: DateTime<Utc>,
}

/// Outcome for one input server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerReadiness {
    /// Server that was checked.
    pub server: Server,
    /// Success details or the reason the check ended.
    pub outcome: Result<ReadyServer, ReadinessError>,
}

impl ServerReadiness {
    /// Returns `true` when the server passed every check.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Returns the failure, if any.
    #[must_use]
    pub fn error(&self) -> Option<&ReadinessError> {
        self.outcome.as_ref().err()
    }
}

/// Results of a batch, one per input server in input order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReadinessReport {
    /// Per-server outcomes.
    pub results: Vec<ServerReadiness>,
}

impl ReadinessReport {
    /// Returns `true` when every server is ready.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        self.results.iter().all(ServerReadiness::is_ready)
    }

    /// Failed outcomes, in input order.
    pub fn failures(&self) -> impl Iterator<Item = &ReadinessError> {
        self.results.iter().filter_map(ServerReadiness::error)
    }

    /// Converts the report into the aggregate result.
    ///
    /// # Errors
    ///
    /// Returns the first failure, in input order, when any server is not
    /// ready.
    pub fn ensure_ready(&self) -> Result<(), ReadinessError> {
        self.failures().next().map_or(Ok(()), |err| Err(err.clone()))
    }
}

/// Polls servers over SSH until they are booted and configured.
#[derive(Debug)]
pub struct ReadinessChecker<T> {
    transport: Arc<T>,
    config: ReadinessConfig,
    clock: Arc<dyn Clock>,
}

impl<T: SshTransport + 'static> ReadinessChecker<T> {
    /// Creates a checker using `transport` and `config`.
    #[must_use]
    pub fn new(transport: T, config: ReadinessConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Uses `clock` to judge boot time freshness.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the polling parameters.
    #[must_use]
    pub const fn config(&self) -> &ReadinessConfig {
        &self.config
    }

    /// Checks every server concurrently and waits for all of them.
    ///
    /// The returned report holds exactly one entry per request, in request
    /// order. Use [`ReadinessReport::ensure_ready`] for the aggregate result.
    pub async fn check_servers(
        &self,
        requests: Vec<ReadinessRequest>,
        cancel: &CancellationToken,
    ) -> ReadinessReport {
        let deadline = deadline_after(self.config.timeout);
        let pending: Vec<(Server, JoinHandle<Result<ReadyServer, ReadinessError>>)> = requests
            .into_iter()
            .map(|request| {
                let worker = Worker {
                    transport: Arc::clone(&self.transport),
                    clock: Arc::clone(&self.clock),
                    config: self.config.clone(),
                    server: request.server.name.clone(),
                    host: request.server.status.public_net.ssh_host(),
                    identity_file: request.identity_file,
                    deadline,
                    cancel: cancel.child_token(),
                };
                (request.server, tokio::spawn(worker.run()))
            })
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        for (server, handle) in pending {
            let outcome = handle.await.unwrap_or_else(|err| {
                Err(ReadinessError::Worker {
                    server: server.name.clone(),
                    message: err.to_string(),
                })
            });
            results.push(ServerReadiness { server, outcome });
        }
        ReadinessReport { results }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(Duration::from_secs(86_400 * 365)))
        .unwrap_or(now)
}

struct Worker<T> {
    transport: Arc<T>,
    clock: Arc<dyn Clock>,
    config: ReadinessConfig,
    server: String,
    host: Option<String>,
    identity_file: Utf8PathBuf,
    deadline: Instant,
    cancel: CancellationToken,
}

impl<T: SshTransport + 'static> Worker<T> {
    async fn run(self) -> Result<ReadyServer, ReadinessError> {
        let Some(host) = self.host.clone() else {
            warn!(server = %self.server, "server has no reachable address");
            return Err(ReadinessError::MissingAddress {
                server: self.server.clone(),
            });
        };
        let target = SshTarget {
            host,
            port: self.config.port,
            user: self.config.user.clone(),
            identity_file: self.identity_file.clone(),
        };
        info!(
            server = %self.server,
            host = %target.host,
            timeout_secs = self.config.timeout.as_secs(),
            max_attempts = self.config.max_attempts,
            "starting server readiness check"
        );

        let mut last_failure = String::from("no attempt completed");
        for attempt in 1..=self.config.max_attempts {
            let in_flight = self.spawn_attempt(&target);
            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(self.cancelled(attempt)),
                () = sleep_until(self.deadline) => return Err(self.timed_out(attempt)),
                joined = in_flight => joined.map_err(|err| ReadinessError::Worker {
                    server: self.server.clone(),
                    message: err.to_string(),
                })?,
            };

            match outcome {
                Ok(boot_time) => {
                    info!(server = %self.server, attempt, %boot_time, "server is ready");
                    return Ok(ReadyServer {
                        attempts: attempt,
                        boot_time,
                    });
                }
                Err(failure) => {
                    debug!(
                        server = %self.server,
                        attempt,
                        stage = %failure.stage(),
                        error = %failure,
                        "readiness attempt failed"
                    );
                    last_failure = failure.to_string();
                }
            }

            if attempt < self.config.max_attempts {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Err(self.cancelled(attempt)),
                    () = sleep_until(self.deadline) => return Err(self.timed_out(attempt)),
                    () = sleep(self.config.tick) => {}
                }
            }
        }

        warn!(
            server = %self.server,
            attempts = self.config.max_attempts,
            %last_failure,
            "max readiness attempts reached"
        );
        Err(ReadinessError::AttemptsExhausted {
            server: self.server.clone(),
            attempts: self.config.max_attempts,
            last_failure,
        })
    }

    fn spawn_attempt(
        &self,
        target: &SshTarget,
    ) -> JoinHandle<Result<DateTime<Utc>, CheckFailure>> {
        let transport = Arc::clone(&self.transport);
        let clock = Arc::clone(&self.clock);
        let attempt_target = target.clone();
        let window = self.config.boot_window;
        tokio::task::spawn_blocking(move || {
            checks::run_checks(transport.as_ref(), &attempt_target, clock.as_ref(), window)
        })
    }

    fn cancelled(&self, attempts: u32) -> ReadinessError {
        warn!(server = %self.server, attempts, "readiness check cancelled");
        ReadinessError::Cancelled {
            server: self.server.clone(),
            attempts,
        }
    }

    fn timed_out(&self, attempts: u32) -> ReadinessError {
        warn!(
            server = %self.server,
            attempts,
            timeout_secs = self.config.timeout.as_secs(),
            "readiness check timed out"
        );
        ReadinessError::Timeout {
            server: self.server.clone(),
            attempts,
            timeout: self.config.timeout,
        }
    }
}

#[cfg(test)]
mod tests;
