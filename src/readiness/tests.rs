//! Unit tests for readiness probing.

use std::net::IpAddr;

use super::*;
use crate::model::{PublicNet, ServerStatus};
use crate::test_support::{ManualClock, ScriptedTransport};
use chrono::TimeZone;
use rstest::{fixture, rstest};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 9, 30, 0)
        .single()
        .expect("valid timestamp")
}

fn server(name: &str, ip: Option<[u8; 4]>) -> Server {
    Server {
        name: name.to_owned(),
        status: ServerStatus {
            public_net: PublicNet {
                ipv4: ip.map(IpAddr::from),
                ..PublicNet::default()
            },
            ..ServerStatus::default()
        },
        ..Server::default()
    }
}

fn request(name: &str, ip: Option<[u8; 4]>) -> ReadinessRequest {
    ReadinessRequest {
        server: server(name, ip),
        identity_file: Utf8PathBuf::from("/keys/demo-admin"),
    }
}

fn fast_config(max_attempts: u32) -> ReadinessConfig {
    ReadinessConfig {
        timeout: Duration::from_secs(5),
        max_attempts,
        tick: Duration::from_millis(10),
        ..ReadinessConfig::default()
    }
}

#[fixture]
fn transport() -> ScriptedTransport {
    ScriptedTransport::new()
}

fn checker(
    transport: &ScriptedTransport,
    config: ReadinessConfig,
) -> ReadinessChecker<ScriptedTransport> {
    ReadinessChecker::new(transport.clone(), config)
        .with_clock(Arc::new(ManualClock::new(now())))
}

#[rstest]
#[tokio::test]
async fn ready_server_passes_on_first_attempt(transport: ScriptedTransport) {
    let booted = now() - TimeDelta::minutes(2);
    transport.script_ready("10.0.0.1", booted);

    let report = checker(&transport, fast_config(3))
        .check_servers(vec![request("demo-cp", Some([10, 0, 0, 1]))], &CancellationToken::new())
        .await;

    assert!(report.all_ready());
    assert_eq!(report.ensure_ready(), Ok(()));
    let result = report.results.first().expect("one result");
    assert_eq!(
        result.outcome,
        Ok(ReadyServer {
            attempts: 1,
            boot_time: booted,
        })
    );
    assert_eq!(transport.connections("10.0.0.1"), 1);
    assert_eq!(
        transport.commands("10.0.0.1"),
        vec![
            CLOUD_INIT_STATUS_COMMAND,
            BOOT_TIME_COMMAND,
            REBOOT_REQUIRED_COMMAND,
            PACKAGE_STATUS_COMMAND,
        ]
    );
}

#[rstest]
#[tokio::test]
async fn pending_cloud_init_exhausts_attempts(transport: ScriptedTransport) {
    transport.respond("10.0.0.1", CLOUD_INIT_STATUS_COMMAND, 0, "status: running\n");

    let report = checker(&transport, fast_config(3))
        .check_servers(vec![request("demo-cp", Some([10, 0, 0, 1]))], &CancellationToken::new())
        .await;

    let err = report.ensure_ready().expect_err("server never becomes ready");
    assert_eq!(
        err,
        ReadinessError::AttemptsExhausted {
            server: String::from("demo-cp"),
            attempts: 3,
            last_failure: String::from("cloud-init not done yet: status: running"),
        }
    );
    assert_eq!(transport.connections("10.0.0.1"), 3);
}

#[rstest]
#[case::stale_boot(TimeDelta::hours(3), "no", "ok", CheckStage::BootTime)]
#[case::reboot_pending(TimeDelta::minutes(1), "yes", "ok", CheckStage::RebootMarker)]
#[case::upgrades_pending(TimeDelta::minutes(1), "no", "pending", CheckStage::Packages)]
fn checks_stop_at_the_first_failure(
    transport: ScriptedTransport,
    #[case] boot_age: TimeDelta,
    #[case] reboot: &str,
    #[case] packages: &str,
    #[case] stage: CheckStage,
) {
    let host = "10.0.0.9";
    transport.respond(host, CLOUD_INIT_STATUS_COMMAND, 0, "status: done");
    transport.respond(
        host,
        BOOT_TIME_COMMAND,
        0,
        &(now() - boot_age).format(BOOT_TIME_FORMAT).to_string(),
    );
    transport.respond(host, REBOOT_REQUIRED_COMMAND, 0, reboot);
    transport.respond(host, PACKAGE_STATUS_COMMAND, 0, packages);
    let target = SshTarget {
        host: host.to_owned(),
        port: 22,
        user: String::from("ansible"),
        identity_file: Utf8PathBuf::from("/keys/demo-admin"),
    };

    let failure = checks::run_checks(
        &transport,
        &target,
        &ManualClock::new(now()),
        TimeDelta::minutes(5),
    )
    .expect_err("checks should fail");

    assert_eq!(failure.stage(), stage);
}

#[rstest]
fn cloud_init_recoverable_exit_code_is_accepted(transport: ScriptedTransport) {
    let host = "10.0.0.9";
    transport.script_ready(host, now());
    transport.respond(host, CLOUD_INIT_STATUS_COMMAND, 2, "status: done");
    let target = SshTarget {
        host: host.to_owned(),
        port: 22,
        user: String::from("ansible"),
        identity_file: Utf8PathBuf::from("/keys/demo-admin"),
    };

    // The first queued response (exit 0) is consumed before the override.
    let first = checks::run_checks(&transport, &target, &ManualClock::new(now()), TimeDelta::minutes(5));
    let second = checks::run_checks(&transport, &target, &ManualClock::new(now()), TimeDelta::minutes(5));

    assert_eq!(first, Ok(now()));
    assert_eq!(second, Ok(now()));
}

#[rstest]
#[tokio::test]
async fn results_follow_input_order_and_failures_stay_isolated(transport: ScriptedTransport) {
    transport.respond("10.0.0.1", CLOUD_INIT_STATUS_COMMAND, 0, "status: running");
    transport.script_ready("10.0.0.2", now());

    let report = checker(&transport, fast_config(2))
        .check_servers(
            vec![
                request("demo-cp", Some([10, 0, 0, 1])),
                request("demo-node-01", Some([10, 0, 0, 2])),
                request("demo-node-02", None),
            ],
            &CancellationToken::new(),
        )
        .await;

    let names: Vec<&str> = report
        .results
        .iter()
        .map(|result| result.server.name.as_str())
        .collect();
    assert_eq!(names, vec!["demo-cp", "demo-node-01", "demo-node-02"]);
    let ready: Vec<bool> = report.results.iter().map(ServerReadiness::is_ready).collect();
    assert_eq!(ready, vec![false, true, false]);
    assert_eq!(
        report.results.get(2).and_then(ServerReadiness::error),
        Some(&ReadinessError::MissingAddress {
            server: String::from("demo-node-02"),
        })
    );
    assert_eq!(report.failures().count(), 2);
}

#[rstest]
#[tokio::test]
async fn connection_failures_are_retried(transport: ScriptedTransport) {
    transport.script_ready("10.0.0.1", now());
    transport.fail_connect("10.0.0.1", 2);

    let report = checker(&transport, fast_config(5))
        .check_servers(vec![request("demo-cp", Some([10, 0, 0, 1]))], &CancellationToken::new())
        .await;

    let outcome = report.results.first().map(|result| result.outcome.clone());
    assert_eq!(
        outcome,
        Some(Ok(ReadyServer {
            attempts: 3,
            boot_time: now(),
        }))
    );
}

#[rstest]
#[tokio::test]
async fn shared_deadline_stops_every_worker(transport: ScriptedTransport) {
    transport.respond("10.0.0.1", CLOUD_INIT_STATUS_COMMAND, 0, "status: running");
    let config = ReadinessConfig {
        timeout: Duration::from_millis(50),
        max_attempts: 100,
        tick: Duration::from_secs(60),
        ..ReadinessConfig::default()
    };

    let report = checker(&transport, config)
        .check_servers(vec![request("demo-cp", Some([10, 0, 0, 1]))], &CancellationToken::new())
        .await;

    let err = report.ensure_ready().expect_err("deadline passes");
    assert!(
        matches!(err, ReadinessError::Timeout { attempts: 1, .. }),
        "got {err:?}"
    );
}

#[rstest]
#[tokio::test]
async fn cancellation_ends_pending_checks(transport: ScriptedTransport) {
    transport.respond("10.0.0.1", CLOUD_INIT_STATUS_COMMAND, 0, "status: running");
    let config = ReadinessConfig {
        tick: Duration::from_secs(60),
        ..fast_config(10)
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = checker(&transport, config)
        .check_servers(vec![request("demo-cp", Some([10, 0, 0, 1]))], &cancel)
        .await;

    assert_eq!(
        report.ensure_ready(),
        Err(ReadinessError::Cancelled {
            server: String::from("demo-cp"),
            attempts: 1,
        })
    );
}

#[rstest]
#[tokio::test]
async fn empty_batches_report_nothing(transport: ScriptedTransport) {
    let report = checker(&transport, fast_config(1))
        .check_servers(Vec::new(), &CancellationToken::new())
        .await;
    assert!(report.results.is_empty());
    assert!(report.all_ready());
}
