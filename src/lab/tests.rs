//! Unit tests for lab orchestration against the in-memory backend.

use std::time::Duration;

use super::*;
use crate::backend::SshKeyRequest;
use crate::backend::memory::{MemoryBackend, Operation};
use crate::labels::Labels;
use crate::model::{
    DeleteStatus, Lab, LabServer, LabSpec, LabVolume, ResourceKind, Server, ServerStatus,
};
use crate::readiness::ReadinessConfig;
use crate::test_support::{ManualClock, ScriptedTransport, StaticKeyStore};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use rstest::{fixture, rstest};

type TestOrchestrator = LabOrchestrator<MemoryBackend, StaticKeyStore, ScriptedTransport>;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0)
        .single()
        .expect("valid timestamp")
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

struct Harness {
    clock: ManualClock,
    backend: MemoryBackend,
    keys: StaticKeyStore,
    transport: ScriptedTransport,
    orchestrator: TestOrchestrator,
}

impl Harness {
    fn script_ready(&self, hosts: &[&str]) {
        for host in hosts {
            self.transport.script_ready(host, start());
        }
    }

    fn operations(&self) -> Vec<Operation> {
        self.backend
            .calls()
            .into_iter()
            .map(|call| call.operation)
            .collect()
    }

    fn count(&self, operation: Operation) -> usize {
        self.operations()
            .into_iter()
            .filter(|op| *op == operation)
            .count()
    }
}

fn settings() -> LabSettings {
    LabSettings {
        owner: String::from("Ops Team"),
        organization: String::from("ACME Corp."),
        email: String::from("ops@example.com"),
        default_key_name: Some(String::from("default")),
        ..LabSettings::default()
    }
}

#[fixture]
fn harness() -> Harness {
    let clock = ManualClock::new(start());
    let backend = MemoryBackend::new().with_clock(Arc::new(clock.clone()));
    backend.add_protected_key("default", "ssh-ed25519 AAAA default");
    let keys = StaticKeyStore::new("/keys");
    let transport = ScriptedTransport::new();
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
    let store = LabStore::open_in_memory("labs").expect("in-memory store");
    let orchestrator = LabOrchestrator::new(backend.clone(), keys.clone(), checker, store)
        .with_clock(Arc::new(clock.clone()))
        .with_settings(settings());
    Harness {
        clock,
        backend,
        keys,
        transport,
        orchestrator,
    }
}

fn lab_server(name: &str) -> LabServer {
    LabServer {
        name: name.to_owned(),
        server_type: String::from("cx22"),
        image: String::from("ubuntu-24.04"),
    }
}

fn demo_lab(name: &str, ttl: &str) -> Lab {
    Lab {
        spec: LabSpec {
            ttl: ttl.to_owned(),
            servers: vec![lab_server("cp"), lab_server("node-01")],
            volumes: vec![LabVolume {
                name: String::from("volume-01"),
                server: Some(String::from("node-01")),
                size: 100,
                automount: None,
                format: None,
            }],
            ..LabSpec::default()
        },
        ..Lab::new(name)
    }
}

async fn created_demo(harness: &Harness) -> Lab {
    harness.script_ready(&["10.0.0.1", "10.0.0.2"]);
    harness
        .orchestrator
        .create(demo_lab("demo", "2h"))
        .await
        .expect("demo lab should be created")
}

#[rstest]
#[tokio::test]
async fn create_names_and_labels_every_resource(harness: Harness) {
    let lab = created_demo(&harness).await;

    let names: Vec<&str> = lab.status.servers.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["demo-cp", "demo-node-01"]);
    for server in &lab.status.servers {
        assert_eq!(server.lab_name(), Some("demo"));
        assert_eq!(
            server.labels.get("delete_after").map(String::as_str),
            Some("2026-10-16-11-00")
        );
        assert_eq!(server.labels.get("owner").map(String::as_str), Some("OpsTeam"));
        assert_eq!(
            server.labels.get("organization").map(String::as_str),
            Some("ACMECorp")
        );
        assert_eq!(server.spec.ssh_key_names, vec!["demo-admin", "default"]);
        assert_eq!(server.spec.location, "nbg1");
    }
    assert_eq!(lab.status.delete_after, Some(at(11, 0)));
    assert_eq!(lab.status.created, Some(start()));
    assert_eq!(lab.status.owner, "OpsTeam");
    assert_eq!(lab.spec.provider, "hetzner");

    let volume = lab.status.volumes.first().expect("one volume");
    assert_eq!(volume.name, "demo-volume-01");
    assert_eq!(volume.spec.server_name.as_deref(), Some("demo-node-01"));
    assert!(!volume.spec.automount);
    assert_eq!(volume.spec.format, "xfs");

    assert_eq!(harness.keys.key_names(), vec!["demo-admin"]);
    assert_eq!(
        harness.orchestrator.store().get("demo").expect("store read"),
        Some(lab)
    );
}

#[rstest]
#[tokio::test]
async fn create_runs_keys_servers_readiness_then_volumes(harness: Harness) {
    created_demo(&harness).await;

    assert_eq!(
        harness.operations(),
        vec![
            Operation::KeyExists,
            Operation::CreateSshKey,
            Operation::KeyExists,
            Operation::CreateServer,
            Operation::CreateServer,
            Operation::CreateVolume,
        ]
    );
    assert_eq!(harness.transport.connections("10.0.0.1"), 1);
    assert_eq!(harness.transport.connections("10.0.0.2"), 1);
}

#[rstest]
#[case::no_servers(|lab: &mut Lab| lab.spec.servers.clear(), "at least one server")]
#[case::duplicate_server(
    |lab: &mut Lab| lab.spec.servers.push(lab_server("cp")),
    "duplicate server name cp"
)]
#[case::unknown_volume_server(
    |lab: &mut Lab| {
        if let Some(volume) = lab.spec.volumes.first_mut() {
            volume.server = Some(String::from("node-09"));
        }
    },
    "unknown server node-09"
)]
#[case::bad_name(|lab: &mut Lab| lab.name = String::from("demo lab"), "lab names")]
#[tokio::test]
async fn create_rejects_inconsistent_labs(
    harness: Harness,
    #[case] corrupt: fn(&mut Lab),
    #[case] reason: &str,
) {
    let mut lab = demo_lab("demo", "2h");
    corrupt(&mut lab);

    let err = harness
        .orchestrator
        .create(lab)
        .await
        .expect_err("definition should be rejected");

    assert!(
        matches!(&err, LabError::Validation { reason: text, .. } if text.contains(reason)),
        "got {err:?}"
    );
    assert!(harness.backend.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn create_rejects_unparsable_ttl(harness: Harness) {
    let err = harness
        .orchestrator
        .create(demo_lab("demo", "forever"))
        .await
        .expect_err("ttl should be rejected");

    assert!(matches!(err, LabError::Ttl(_)), "got {err:?}");
    assert!(harness.backend.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn create_refuses_to_reuse_an_admin_key(harness: Harness) {
    let leftover = SshKeyRequest {
        name: String::from("demo-admin"),
        public_key: String::from("ssh-ed25519 AAAA leftover"),
        labels: Labels::new(),
        ttl: String::from("1h"),
    };
    harness
        .backend
        .create_ssh_key(&leftover)
        .await
        .expect("seed leftover key");

    let err = harness
        .orchestrator
        .create(demo_lab("demo", "2h"))
        .await
        .expect_err("existing key should block creation");

    assert_eq!(
        err,
        LabError::AdminKeyExists {
            key: String::from("demo-admin"),
        }
    );
    assert_eq!(harness.count(Operation::CreateServer), 0);
    assert!(harness.keys.key_names().is_empty());
}

#[rstest]
#[tokio::test]
async fn unready_servers_stop_creation_before_volumes(harness: Harness) {
    harness.script_ready(&["10.0.0.1"]);

    let err = harness
        .orchestrator
        .create(demo_lab("demo", "2h"))
        .await
        .expect_err("second server never becomes reachable");

    let LabError::ServerNotReady { server, reason } = err else {
        panic!("expected ServerNotReady");
    };
    assert_eq!(server, "demo-node-01");
    assert!(matches!(
        reason,
        ReadinessError::AttemptsExhausted { attempts: 2, .. }
    ));
    assert_eq!(harness.count(Operation::CreateVolume), 0);
    assert_eq!(harness.backend.servers().len(), 2, "no rollback");
    assert_eq!(harness.orchestrator.store().get("demo").expect("read"), None);
}

#[rstest]
#[tokio::test]
async fn backend_failures_stop_creation_immediately(harness: Harness) {
    harness.backend.fail_on(Operation::CreateServer, "quota exceeded");

    let err = harness
        .orchestrator
        .create(demo_lab("demo", "2h"))
        .await
        .expect_err("server creation fails");

    assert_eq!(
        err.to_string(),
        "failed to create server demo-cp: provider error: quota exceeded"
    );
    assert_eq!(harness.count(Operation::CreateServer), 1);
    assert_eq!(harness.backend.ssh_keys().len(), 2, "admin key stays behind");
}

#[rstest]
#[tokio::test]
async fn cancelled_orchestrators_fail_the_readiness_gate(harness: Harness) {
    let Harness {
        orchestrator,
        transport,
        backend,
        ..
    } = harness;
    transport.script_ready("10.0.0.1", start());
    transport.script_ready("10.0.0.2", start());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let orchestrator = orchestrator.with_cancellation(cancel);

    let err = orchestrator
        .create(demo_lab("demo", "2h"))
        .await
        .expect_err("cancelled before readiness");

    assert!(
        matches!(
            err,
            LabError::ServerNotReady {
                reason: ReadinessError::Cancelled { .. },
                ..
            }
        ),
        "got {err:?}"
    );
    assert!(orchestrator.cancellation_token().is_cancelled());
    assert!(backend.volumes().is_empty());
}

#[rstest]
#[tokio::test]
async fn get_rebuilds_missing_records_from_the_backend(harness: Harness) {
    let created = created_demo(&harness).await;
    assert!(harness.orchestrator.store().delete("demo").expect("drop record"));

    let lab = harness.orchestrator.get("demo").await.expect("rebuilt");

    assert_eq!(lab.status.delete_after, created.status.delete_after);
    assert_eq!(lab.status.owner, "OpsTeam");
    assert_eq!(lab.spec.ttl, "2h");
    assert_eq!(lab.spec.servers, created.spec.servers);
    assert_eq!(lab.status.volumes.len(), 1);
    assert_eq!(harness.count(Operation::ListServers), 1);

    harness.orchestrator.get("demo").await.expect("cached");
    assert_eq!(harness.count(Operation::ListServers), 1, "second read is a cache hit");
}

#[rstest]
#[tokio::test]
async fn unknown_labs_are_not_found(harness: Harness) {
    let err = harness
        .orchestrator
        .get("ghost")
        .await
        .expect_err("nothing carries the label");

    assert_eq!(
        err,
        LabError::NotFound {
            lab: String::from("ghost"),
        }
    );
}

#[rstest]
#[tokio::test]
async fn delete_before_expiry_is_deferred_without_backend_deletes(harness: Harness) {
    created_demo(&harness).await;
    harness.clock.advance(TimeDelta::minutes(1));

    let deletion = harness
        .orchestrator
        .delete("demo", false)
        .await
        .expect("deferral is not an error");

    assert!(!deletion.is_deleted());
    assert_eq!(deletion.status.delete_after(), Some(at(11, 0)));
    assert!(deletion.resources.is_empty());
    assert_eq!(
        deletion.to_string(),
        "lab demo is not ready for deletion until 2026-10-16 11:00:00 UTC"
    );
    assert!(harness.backend.destructive_calls().is_empty());
    assert!(harness.orchestrator.store().get("demo").expect("read").is_some());
}

#[rstest]
#[tokio::test]
async fn forced_delete_sweeps_volumes_servers_then_keys(harness: Harness) {
    created_demo(&harness).await;

    let deletion = harness
        .orchestrator
        .delete("demo", true)
        .await
        .expect("sweep completes");

    assert_eq!(deletion.status, DeleteStatus::Deleted);
    let swept: Vec<(ResourceKind, &str)> = deletion
        .resources
        .iter()
        .map(|resource| (resource.kind, resource.name.as_str()))
        .collect();
    assert_eq!(
        swept,
        vec![
            (ResourceKind::Volume, "demo-volume-01"),
            (ResourceKind::Server, "demo-cp"),
            (ResourceKind::Server, "demo-node-01"),
            (ResourceKind::SshKey, "demo-admin"),
        ]
    );
    assert!(harness.backend.servers().is_empty());
    assert!(harness.backend.volumes().is_empty());
    let remaining: Vec<String> = harness
        .backend
        .ssh_keys()
        .into_iter()
        .map(|key| key.name)
        .collect();
    assert_eq!(remaining, vec!["default"], "default key is never deleted");
    assert_eq!(harness.keys.deleted(), vec!["demo-admin"]);
    assert_eq!(harness.orchestrator.store().get("demo").expect("read"), None);
}

#[rstest]
#[tokio::test]
async fn expired_labs_delete_without_force(harness: Harness) {
    created_demo(&harness).await;
    harness.clock.set(at(11, 0));

    let deletion = harness
        .orchestrator
        .delete("demo", false)
        .await
        .expect("sweep completes");

    assert!(deletion.is_deleted());
    assert_eq!(deletion.leftovers().count(), 0);
}

#[rstest]
#[tokio::test]
async fn delete_keeps_going_after_a_failure(harness: Harness) {
    created_demo(&harness).await;
    harness.backend.fail_on(Operation::DeleteVolume, "volume busy");

    let deletion = harness
        .orchestrator
        .delete("demo", true)
        .await
        .expect("sweep completes");

    assert!(matches!(deletion.status, DeleteStatus::Failed { .. }));
    let leftovers: Vec<&str> = deletion
        .leftovers()
        .map(|resource| resource.name.as_str())
        .collect();
    assert_eq!(leftovers, vec!["demo-volume-01"]);
    assert!(harness.backend.servers().is_empty());
    assert_eq!(harness.backend.volumes().len(), 1);
    assert_eq!(harness.orchestrator.store().get("demo").expect("read"), None);
    assert!(deletion.to_string().starts_with("lab demo only partially deleted"));
}

#[rstest]
#[tokio::test]
async fn resources_already_gone_count_as_deleted(harness: Harness) {
    created_demo(&harness).await;
    assert!(harness.backend.remove_server("demo-cp").is_some());
    harness.backend.fail_on(Operation::ListServers, "api unavailable");

    let deletion = harness
        .orchestrator
        .delete("demo", true)
        .await
        .expect("sweep completes");

    assert!(deletion.is_deleted(), "got {deletion:?}");
    assert!(harness.backend.servers().is_empty());
}

#[rstest]
#[tokio::test]
async fn sync_replaces_the_cache_with_backend_labs(harness: Harness) {
    created_demo(&harness).await;
    harness.backend.insert_server(Server {
        name: String::from("other-cp"),
        labels: Labels::from([(String::from("lab_name"), String::from("other"))]),
        status: ServerStatus {
            state: String::from("running"),
            ..ServerStatus::default()
        },
        ..Server::default()
    });
    harness
        .orchestrator
        .store()
        .save(&Lab::new("ghost"))
        .expect("seed stale record");

    let synced = harness.orchestrator.sync_labs().await.expect("sync");

    let names: Vec<String> = synced.into_iter().map(|lab| lab.name).collect();
    assert_eq!(names, vec!["demo", "other"]);
    let cached: Vec<String> = harness
        .orchestrator
        .list()
        .expect("list")
        .into_iter()
        .map(|lab| lab.name)
        .collect();
    assert_eq!(cached, vec!["demo", "other"]);

    assert!(harness.backend.remove_server("demo-cp").is_some());
    assert!(harness.backend.remove_server("demo-node-01").is_some());
    harness.orchestrator.sync_labs().await.expect("second sync");

    let cached: Vec<String> = harness
        .orchestrator
        .list()
        .expect("list")
        .into_iter()
        .map(|lab| lab.name)
        .collect();
    assert_eq!(cached, vec!["other"]);
}

#[rstest]
#[tokio::test]
async fn failed_sync_keeps_the_previous_cache(harness: Harness) {
    created_demo(&harness).await;
    harness.backend.fail_on(Operation::AllServers, "api unavailable");

    let err = harness.orchestrator.sync_labs().await.expect_err("sync fails");

    assert!(matches!(err, LabError::Backend { .. }), "got {err:?}");
    assert_eq!(harness.orchestrator.list().expect("list").len(), 1);
}

#[rstest]
#[tokio::test]
async fn reaping_deletes_only_expired_labs(harness: Harness) {
    created_demo(&harness).await;
    harness.script_ready(&["10.0.0.3"]);
    let short = Lab {
        spec: LabSpec {
            ttl: String::from("30m"),
            servers: vec![lab_server("cp")],
            ..LabSpec::default()
        },
        ..Lab::new("short")
    };
    harness.orchestrator.create(short).await.expect("short lab");
    harness.clock.advance(TimeDelta::hours(1));

    let summary = harness.orchestrator.reap_expired().await.expect("reap");

    assert_eq!(
        summary,
        ReapSummary {
            deleted: vec![String::from("short")],
            deferred: vec![String::from("demo")],
            failed: Vec::new(),
        }
    );
    let remaining: Vec<String> = harness
        .backend
        .servers()
        .into_iter()
        .map(|server| server.name)
        .collect();
    assert_eq!(remaining, vec!["demo-cp", "demo-node-01"]);
}

#[rstest]
fn settings_follow_the_configuration() {
    let config = crate::config::LabConfig {
        state_path: String::from("/tmp/labrat.redb"),
        state_table: String::from("labs"),
        keys_dir: String::from("/tmp/keys"),
        owner: String::from("ops"),
        organization: String::from("acme"),
        email: String::from("ops@example.com"),
        default_provider: String::from("lima"),
        default_location: String::from("local"),
        default_ttl: String::from("4h"),
        default_key_name: Some(String::from(" ")),
        admin_user: String::from(" admin "),
        ssh_bin: String::from("ssh"),
        ssh_keygen_bin: String::from("ssh-keygen"),
        ssh_port: 22,
        readiness_timeout_secs: 60,
        readiness_max_attempts: 3,
        readiness_tick_secs: 5,
        volume_format: String::from("ext4"),
        volume_automount: true,
    };

    let settings = LabSettings::from_config(&config);

    assert_eq!(settings.default_provider, "lima");
    assert_eq!(settings.default_ttl, "4h");
    assert_eq!(settings.default_key_name, None);
    assert_eq!(settings.admin_user, "admin");
    assert_eq!(settings.volume_format, "ext4");
    assert!(settings.volume_automount);
}
