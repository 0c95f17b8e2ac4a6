//! Deterministic doubles for the runner, SSH, key and clock seams.
//!
//! Public so integration tests and downstream adapters can drive a
//! [`crate::lab::LabOrchestrator`] without processes, network or real time.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8PathBuf;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::keys::{KeyError, KeyStore};
use crate::readiness::{
    BOOT_TIME_COMMAND, BOOT_TIME_FORMAT, CLOUD_INIT_STATUS_COMMAND, PACKAGE_STATUS_COMMAND,
    REBOOT_REQUIRED_COMMAND,
};
use crate::remote::{
    CommandOutput, CommandRunner, RemoteCommandOutput, RemoteError, SshSession, SshTarget,
    SshTransport,
};
use crate::ttl::Clock;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`CommandRunner`] answering from a queue of canned outputs.
///
/// Every call is journalled; a call with nothing queued fails to spawn.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<RunnerState>>,
}

#[derive(Debug, Default)]
struct RunnerState {
    queued: VecDeque<CommandOutput>,
    calls: Vec<CommandInvocation>,
}

/// One program launch seen by [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program as given to [`CommandRunner::run`].
    pub program: String,
    /// Its arguments.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Program and arguments joined by spaces, without quoting.
    #[must_use]
    pub fn command_string(&self) -> String {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().map(|arg| arg.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a runner with an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls made so far, oldest first.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.state).calls.clone()
    }

    /// Queues a silent exit with status 0.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Queues a non-zero exit.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", format!("exit status {code}"));
    }

    /// Queues an arbitrary outcome.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.state).queued.push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RemoteError> {
        let mut state = lock(&self.state);
        state.calls.push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        state.queued.pop_front().ok_or_else(|| RemoteError::Spawn {
            program: program.to_owned(),
            message: String::from("nothing queued"),
        })
    }
}

#[derive(Debug, Default)]
struct HostScript {
    responses: BTreeMap<String, VecDeque<RemoteCommandOutput>>,
    connect_failures: u32,
    connections: u32,
    commands: Vec<String>,
}

/// Scripted SSH transport keyed by host and command string.
///
/// Responses queued for a command are consumed in order; the last one keeps
/// answering once the queue is down to a single entry. Hosts without a script
/// refuse connections and unscripted commands exit with status 127.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    hosts: Arc<Mutex<BTreeMap<String, HostScript>>>,
}

impl ScriptedTransport {
    /// Creates a transport with no scripted hosts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response for `command` on `host`.
    pub fn respond(&self, host: &str, command: &str, exit_code: i32, stdout: &str) {
        lock(&self.hosts)
            .entry(host.to_owned())
            .or_default()
            .responses
            .entry(command.to_owned())
            .or_default()
            .push_back(RemoteCommandOutput {
                exit_code: Some(exit_code),
                stdout: stdout.to_owned(),
                stderr: String::new(),
            });
    }

    /// Scripts every readiness check on `host` to pass with `boot_time`.
    pub fn script_ready(&self, host: &str, boot_time: DateTime<Utc>) {
        self.respond(host, CLOUD_INIT_STATUS_COMMAND, 0, "\nstatus: done\n");
        self.respond(
            host,
            BOOT_TIME_COMMAND,
            0,
            &format!("{}\n", boot_time.format(BOOT_TIME_FORMAT)),
        );
        self.respond(host, REBOOT_REQUIRED_COMMAND, 0, "no\n");
        self.respond(host, PACKAGE_STATUS_COMMAND, 0, "ok\n");
    }

    /// Makes the next `times` connection attempts to `host` fail.
    pub fn fail_connect(&self, host: &str, times: u32) {
        lock(&self.hosts)
            .entry(host.to_owned())
            .or_default()
            .connect_failures = times;
    }

    /// Number of successful connections made to `host`.
    #[must_use]
    pub fn connections(&self, host: &str) -> u32 {
        lock(&self.hosts)
            .get(host)
            .map_or(0, |script| script.connections)
    }

    /// Commands executed on `host`, in order.
    #[must_use]
    pub fn commands(&self, host: &str) -> Vec<String> {
        lock(&self.hosts)
            .get(host)
            .map(|script| script.commands.clone())
            .unwrap_or_default()
    }
}

impl SshTransport for ScriptedTransport {
    fn connect(&self, target: &SshTarget) -> Result<Box<dyn SshSession + '_>, RemoteError> {
        let mut hosts = lock(&self.hosts);
        let refused = |message: &str| RemoteError::Connect {
            host: target.host.clone(),
            message: message.to_owned(),
        };
        let Some(script) = hosts.get_mut(&target.host) else {
            return Err(refused("no route to host"));
        };
        if script.connect_failures > 0 {
            script.connect_failures -= 1;
            return Err(refused("connection refused"));
        }
        script.connections += 1;
        Ok(Box::new(ScriptedSession {
            hosts: Arc::clone(&self.hosts),
            host: target.host.clone(),
        }))
    }
}

struct ScriptedSession {
    hosts: Arc<Mutex<BTreeMap<String, HostScript>>>,
    host: String,
}

impl SshSession for ScriptedSession {
    fn exec(&mut self, command: &str) -> Result<RemoteCommandOutput, RemoteError> {
        let mut hosts = lock(&self.hosts);
        let script = hosts.entry(self.host.clone()).or_default();
        script.commands.push(command.to_owned());
        let response = script.responses.get_mut(command).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });
        Ok(response.unwrap_or_else(|| RemoteCommandOutput {
            exit_code: Some(127),
            stdout: String::new(),
            stderr: format!("{command}: command not found"),
        }))
    }
}

/// In-memory [`KeyStore`] returning deterministic public keys.
#[derive(Clone, Debug)]
pub struct StaticKeyStore {
    keys_dir: Utf8PathBuf,
    keys: Arc<Mutex<BTreeSet<String>>>,
    deleted: Arc<Mutex<Vec<String>>>,
}

impl StaticKeyStore {
    /// Creates a store reporting private keys under `keys_dir`.
    #[must_use]
    pub fn new(keys_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            keys_dir: keys_dir.into(),
            keys: Arc::default(),
            deleted: Arc::default(),
        }
    }

    /// Public key returned for `name`.
    #[must_use]
    pub fn public_key(name: &str) -> String {
        format!("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIStatic {name}")
    }

    /// Names of key pairs currently held.
    #[must_use]
    pub fn key_names(&self) -> Vec<String> {
        lock(&self.keys).iter().cloned().collect()
    }

    /// Names passed to [`KeyStore::delete_key_pair`], in order.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }
}

impl KeyStore for StaticKeyStore {
    fn create_key_pair(&self, name: &str) -> Result<String, KeyError> {
        lock(&self.keys).insert(name.to_owned());
        Ok(Self::public_key(name))
    }

    fn private_key_path(&self, name: &str) -> Utf8PathBuf {
        self.keys_dir.join(name)
    }

    fn delete_key_pair(&self, name: &str) -> Result<(), KeyError> {
        lock(&self.keys).remove(name);
        lock(&self.deleted).push(name.to_owned());
        Ok(())
    }
}

/// Settable [`Clock`] for deterministic TTL tests.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Creates a clock frozen at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Moves the clock to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *lock(&self.now) = now;
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: TimeDelta) {
        let mut now = lock(&self.now);
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

/// Serialises tests that touch process environment variables.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Sets environment variables for the lifetime of the guard.
///
/// Holds [`ENV_LOCK`] and puts the previous values back when dropped.
pub struct EnvGuard {
    saved: Vec<(String, Option<OsString>)>,
    _lock: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Applies `vars` once the lock is acquired.
    pub async fn set_vars(vars: &[(&str, &str)]) -> Self {
        let lock = ENV_LOCK.lock().await;
        let saved = vars
            .iter()
            .map(|(key, value)| {
                let before = env::var_os(key);
                // SAFETY: only code holding `ENV_LOCK` mutates the environment.
                unsafe { env::set_var(key, value) };
                ((*key).to_owned(), before)
            })
            .collect();
        Self { saved, _lock: lock }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, before) in self.saved.iter().rev() {
            // SAFETY: the guard still holds `ENV_LOCK`.
            unsafe {
                match before {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
