//! Integration test: config load, monitor wiring, elevation and shutdown.

mod common;

use std::path::Path;
use std::time::Duration;

use gateway_monitor::exec::CommandOutput;
use gateway_monitor::{Monitor, MonitorConfig, PrivilegeState};

use common::{monitor_config, unwrap_sudo, FakeElevator, FakeRunner};

#[test]
fn config_load_default() {
    let c = MonitorConfig::load(Path::new("nonexistent.json"));
    assert_eq!(c.probes.timeout(), Duration::from_secs(10));
    assert_eq!(c.collection.usage_cache_ttl(), Duration::from_secs(5));
    assert_eq!(c.privilege.renewal_interval(), Duration::from_secs(240));
    assert!(!c.privilege.extend_window_on_grant);
}

#[test]
fn config_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{"probes":{"command_timeout_secs":3},"log":{"level":"debug","json":true}}"#,
    )
    .unwrap();
    let c = MonitorConfig::load(&path);
    assert_eq!(c.probes.timeout(), Duration::from_secs(3));
    assert_eq!(c.log.level, "debug");
    assert!(c.log.json);
    assert_eq!(c.security.max_file_list, 1_000);
}

#[test]
fn invalid_config_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();
    let c = MonitorConfig::load(&path);
    assert_eq!(c.probes.timeout(), Duration::from_secs(10));
}

#[tokio::test]
async fn monitor_elevates_once_and_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|program, args| match unwrap_sudo(program, args) {
        ("lsof", _, true) => Ok(CommandOutput::ok(
            "COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME\n\
             Safari 901 alice 33u IPv4 0xabc 0t0 TCP 192.168.1.20:52000->17.253.144.10:443 (ESTABLISHED)\n",
        )),
        _ => Ok(CommandOutput::failed(1, "unexpected")),
    });
    let elevator = FakeElevator::new(false, true);
    let monitor = Monitor::with_parts(&monitor_config(dir.path()), runner, elevator.clone()).await;
    assert_eq!(monitor.privilege_state(), PrivilegeState::Unknown);

    let conns = monitor.list_network_connections().await.unwrap();
    assert_eq!(conns[0].owning_process_name.as_deref(), Some("Safari"));
    assert_eq!(monitor.request_elevation().await, PrivilegeState::Granted);
    assert_eq!(elevator.prompts(), 1);

    monitor.shutdown().await;
    assert!(dir.path().join("session.json").exists());
}

#[tokio::test]
async fn extend_window_uses_configured_minutes() {
    let dir = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|_, _| Ok(CommandOutput::ok("")));
    let mut config = monitor_config(dir.path());
    config.privilege.elevation_window_minutes = 90;
    let monitor = Monitor::with_parts(&config, runner.clone(), FakeElevator::new(true, false)).await;

    monitor.request_elevation().await;
    monitor.extend_elevation_window().await.unwrap();
    assert_eq!(runner.count("timestamp_timeout=90"), 1);
    monitor.shutdown().await;
}
