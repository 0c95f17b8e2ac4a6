//! Shared lab orchestration fixture for integration tests.
//!
//! Integration tests are compiled as separate crates, so the harness is
//! pulled in with:
//!
//! ```rust
//! #[path = "common/lab_harness.rs"]
//! mod lab_harness;
//! ```

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{DateTime, TimeZone, Utc};
use labrat::test_support::{ManualClock, ScriptedTransport, StaticKeyStore};
use labrat::{
    Clock, LabOrchestrator, LabSettings, LabStore, MemoryBackend, ReadinessChecker, ReadinessConfig,
};
use tempfile::TempDir;

/// Orchestrator type used by the integration tests.
pub type TestOrchestrator = LabOrchestrator<MemoryBackend, StaticKeyStore, ScriptedTransport>;

/// Wall-clock instant every harness starts at.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// Orchestrator wired to in-process doubles and an on-disk lab store.
pub struct LabHarness {
    pub clock: ManualClock,
    pub backend: MemoryBackend,
    pub keys: StaticKeyStore,
    pub transport: ScriptedTransport,
    pub orchestrator: TestOrchestrator,
    pub state_path: Utf8PathBuf,
    _dir: TempDir,
}

impl LabHarness {
    /// Builds a harness whose store lives in a fresh temporary directory.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp path");
        let state_path = root.join("state").join("labrat.redb");
        let clock = ManualClock::new(start());
        let backend = MemoryBackend::new().with_clock(Arc::new(clock.clone()));
        let keys = StaticKeyStore::new(root.join("keys"));
        let transport = ScriptedTransport::new();
        let orchestrator = build_orchestrator(
            &clock,
            &backend,
            &keys,
            &transport,
            LabStore::open(&state_path, "labs").expect("open lab store"),
        );
        Self {
            clock,
            backend,
            keys,
            transport,
            orchestrator,
            state_path,
            _dir: dir,
        }
    }

    /// Scripts `count` hosts, starting at `10.0.0.1`, to pass readiness.
    pub fn script_ready_hosts(&self, count: u8) {
        for host in 1..=count {
            self.transport
                .script_ready(&format!("10.0.0.{host}"), self.clock.now());
        }
    }
}

/// Wires an orchestrator around the given doubles and store.
pub fn build_orchestrator(
    clock: &ManualClock,
    backend: &MemoryBackend,
    keys: &StaticKeyStore,
    transport: &ScriptedTransport,
    store: LabStore,
) -> TestOrchestrator {
    let checker = ReadinessChecker::new(
        transport.clone(),
        ReadinessConfig {
            timeout: Duration::from_secs(5),
            max_attempts: 2,
            tick: Duration::from_millis(10),
            ..ReadinessConfig::default()
        },
    )
    .with_clock(Arc::new(clock.clone()));
    LabOrchestrator::new(backend.clone(), keys.clone(), checker, store)
        .with_clock(Arc::new(clock.clone()))
        .with_settings(LabSettings {
            owner: String::from("ops"),
            ..LabSettings::default()
        })
}
