//! Security audit: settle-all aggregation and detailed enrichment against a
//! scripted host.

mod common;

use std::path::Path;
use std::sync::Arc;

use gateway_monitor::config::SecurityConfig;
use gateway_monitor::error::{MonitorError, Result};
use gateway_monitor::exec::CommandOutput;
use gateway_monitor::privilege::{PrivilegeManager, PrivilegeState};
use gateway_monitor::security::{
    FileVaultState, KextFlag, PfAction, ProbeKind, SecureBootSource, SecurityAuditEngine,
    StartupFlag,
};

use common::{manager, unwrap_sudo, FakeElevator, FakeRunner, TIMEOUT};

const KEXTSTAT: &str = "Index Refs Address            Size       Wired      Name (Version) UUID <Linked Against>
    1  163 0                  0          0          com.apple.kpi.bsd (21.6.0) 7B5A1C6E-2D1A-3F4B-9C8D-0E1F2A3B4C5D <>
   52    0 0xffffff7f83b2e000 0x5000     0x5000     com.example.driver (1.2.3) 11111111-2222-3333-4444-555555555555 <8 6 5 3 1>
";

const PS: &str = "  PID COMM ARGS
    1 /sbin/launchd /sbin/launchd
  812 /opt/example/updater /opt/example/updater --label com.example.updater
";

const LSOF: &str = "COMMAND   PID  USER   FD   TYPE             DEVICE  SIZE/OFF     NODE NAME
Finder    377 alice  txt    REG               1,18    123456 12345678 /System/Library/CoreServices/Finder.app/Contents/MacOS/Finder
updater   812  root    4u   REG               1,18       512     4242 /private/tmp/payload.bin
Safari    901 alice   33u  IPv4 0x1234567890abcdef       0t0      TCP 192.168.1.20:52000->17.253.144.10:443 (ESTABLISHED)
";

const UPDATER_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>com.example.updater</string>
    <key>Program</key>
    <string>/opt/example/updater</string>
    <key>RunAtLoad</key>
    <true/>
</dict>
</plist>
"#;

/// A healthy, unprivileged host
fn host(program: &str, args: &[&str]) -> Result<CommandOutput> {
    let out = match (program, args) {
        ("spctl", _) => CommandOutput::ok("assessments enabled\n"),
        ("defaults", [_, _, "globalstate"]) => CommandOutput::ok("1\n"),
        ("defaults", [_, _, "stealthenabled"]) => CommandOutput::ok("1\n"),
        ("defaults", [_, _, "loggingenabled"]) => CommandOutput::ok("0\n"),
        ("defaults", [_, _, "exceptions"]) => CommandOutput::ok(
            "(\n    {\n        path = \"/Applications/Zoom.app\";\n        state = 2;\n    }\n)\n",
        ),
        ("csrutil", _) => CommandOutput::ok("System Integrity Protection status: enabled.\n"),
        ("kextstat", _) => CommandOutput::ok(KEXTSTAT),
        ("osascript", _) => CommandOutput::ok("Dropbox, Slack\n"),
        ("ps", _) => CommandOutput::ok(PS),
        ("fdesetup", _) => CommandOutput::ok("FileVault is On.\n"),
        ("nvram", _) => CommandOutput::ok("boot-args\t\n"),
        ("system_profiler", _) => CommandOutput::failed(1, ""),
        ("uname", _) => CommandOutput::ok("arm64\n"),
        ("kextfind", [_, id]) => CommandOutput::ok(format!("/Library/Extensions/{id}.kext\n")),
        ("kextutil", [_, _, path]) => CommandOutput::ok(format!("Diagnostics for {path}:\n")),
        ("codesign", _) => CommandOutput::failed(1, "x.kext: code object is not signed at all\n"),
        ("lsof", ["-n"]) => CommandOutput::ok(LSOF),
        ("pfctl", _) => CommandOutput::failed(1, "pfctl: Permission denied"),
        _ => CommandOutput::failed(1, "unexpected"),
    };
    Ok(out)
}

/// Launch agent stored in binary form, as many system plists are
fn binary_agent_plist() -> Vec<u8> {
    let mut dict = plist::Dictionary::new();
    dict.insert("Label".into(), plist::Value::String("com.example.agent".into()));
    dict.insert(
        "ProgramArguments".into(),
        plist::Value::Array(vec![plist::Value::String("/opt/example/agent".into())]),
    );
    let mut raw = Vec::new();
    plist::Value::Dictionary(dict).to_writer_binary(&mut raw).unwrap();
    raw
}

/// Launch directories, an application tree and one configuration file under `root`.
fn layout(root: &Path) -> SecurityConfig {
    let daemons = root.join("Library/LaunchDaemons");
    let agents = root.join("Library/LaunchAgents");
    let apps = root.join("Applications");
    std::fs::create_dir_all(&daemons).unwrap();
    std::fs::create_dir_all(&agents).unwrap();
    std::fs::create_dir_all(apps.join("Example.app/Contents")).unwrap();
    std::fs::write(daemons.join("com.example.updater.plist"), UPDATER_PLIST).unwrap();
    std::fs::write(agents.join("com.example.agent.plist"), binary_agent_plist()).unwrap();
    std::fs::write(agents.join("com.example.broken.plist"), b"bplist00\x00\x01").unwrap();
    std::fs::write(root.join("pf.conf"), "block all\n").unwrap();

    SecurityConfig {
        launch_daemon_dirs: vec![daemons],
        launch_agent_dirs: vec![agents, root.join("missing")],
        application_dirs: vec![apps],
        configuration_files: vec![root.join("pf.conf"), root.join("absent.conf")],
        max_file_list: 1_000,
        enrichment_concurrency: 2,
    }
}

async fn audit(root: &Path, runner: Arc<FakeRunner>) -> SecurityAuditEngine {
    let pm = manager(root, runner.clone(), FakeElevator::new(false, false)).await;
    SecurityAuditEngine::new(runner, pm, layout(root), TIMEOUT)
}

/// Audit engine over a session that has already been granted
async fn granted_audit(
    root: &Path,
    runner: Arc<FakeRunner>,
    elevator: Arc<FakeElevator>,
) -> (SecurityAuditEngine, Arc<PrivilegeManager>) {
    let pm = manager(root, runner.clone(), elevator).await;
    assert_eq!(pm.request_elevation().await, PrivilegeState::Granted);
    let engine = SecurityAuditEngine::new(runner, pm.clone(), layout(root), TIMEOUT);
    (engine, pm)
}

/// Admin host: kextstat and pfctl need sudo, the ALF exceptions key is absent.
fn admin_host(program: &str, args: &[&str]) -> Result<CommandOutput> {
    match unwrap_sudo(program, args) {
        ("defaults", [_, _, "exceptions"], _) => Ok(CommandOutput::failed(
            1,
            "The domain/default pair of (/Library/Preferences/com.apple.alf, exceptions) does not exist",
        )),
        ("pfctl", _, true) => Ok(CommandOutput::ok(
            "pass in quick on lo0 all flags S/SA keep state\nblock drop in proto tcp from any to any port = 23\n",
        )),
        ("kextstat", _, false) => Ok(CommandOutput::failed(1, "Operation not permitted")),
        ("kextstat", _, true) => Ok(CommandOutput::ok(KEXTSTAT)),
        (inner, rest, _) => host(inner, rest),
    }
}

#[tokio::test]
async fn one_failing_probe_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|program, args| {
        if program == "csrutil" {
            return Err(MonitorError::LaunchFailure {
                program: program.into(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        host(program, args)
    });
    let report = audit(dir.path(), runner).await.run_basic_scan().await;

    assert!(!report.detailed);
    assert_eq!(report.findings.len(), 5);
    assert_eq!(report.failed_probes(), vec![ProbeKind::SystemIntegrityProtection]);
    assert!(report.sip().unwrap().error().unwrap().contains("csrutil"));

    let gatekeeper = report.gatekeeper().unwrap().data().unwrap();
    assert!(gatekeeper.enabled);
    let firewall = report.firewall().unwrap().data().unwrap();
    assert!(firewall.enabled);
    assert_eq!(firewall.global_state, 1);
    assert!(firewall.detail.is_none());

    let startup = report.startup_items().unwrap().data().unwrap();
    assert_eq!(startup.system_daemons.len(), 1);
    assert_eq!(startup.user_agents.len(), 2);
    assert_eq!(startup.login_items, vec!["Dropbox", "Slack"]);
    assert!(startup.system_daemons[0].detail.is_none());

    assert_eq!(report.kernel_extensions().unwrap().data().unwrap().len(), 2);
}

#[tokio::test]
async fn kextstat_refusal_without_grant_requires_privilege() {
    let dir = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|program, args| match program {
        "kextstat" => Ok(CommandOutput::failed(1, "Operation not permitted")),
        _ => host(program, args),
    });
    let report = audit(dir.path(), runner).await.run_basic_scan().await;

    assert_eq!(report.failed_probes(), vec![ProbeKind::KernelExtensions]);
    let error = report.kernel_extensions().unwrap().error().unwrap();
    assert!(error.contains("requires admin privileges"));
}

#[tokio::test]
async fn unreadable_firewall_state_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|program, args| match (program, args) {
        ("defaults", _) => Ok(CommandOutput::failed(1, "does not exist")),
        _ => host(program, args),
    });
    let report = audit(dir.path(), runner).await.run_basic_scan().await;
    assert_eq!(report.failed_probes(), vec![ProbeKind::Firewall]);
}

#[tokio::test]
async fn detailed_scan_enriches_every_finding() {
    let dir = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(host);
    let report = audit(dir.path(), runner.clone()).await.run_detailed_scan().await;

    assert!(report.detailed);
    assert_eq!(report.findings.len(), 9);
    assert!(report.failed_probes().is_empty());

    // firewall settings degrade one by one
    let firewall = report.firewall().unwrap().data().unwrap();
    assert!(firewall.enabled);
    let detail = firewall.detail.as_ref().unwrap();
    assert_eq!(detail.stealth_mode.data(), Some(&true));
    assert_eq!(detail.logging.data(), Some(&false));
    assert_eq!(detail.exceptions.data().unwrap().len(), 1);
    assert!(detail.packet_filter_rules.is_error());

    let startup = report.startup_items().unwrap().data().unwrap();
    let daemon = startup.system_daemons[0].detail.as_ref().unwrap().data().unwrap();
    assert_eq!(daemon.plist.label.as_deref(), Some("com.example.updater"));
    assert_eq!(daemon.running.as_ref().map(|p| p.pid), Some(812));
    assert_eq!(
        daemon.flags,
        vec![StartupFlag::AutoStart, StartupFlag::RootDaemon, StartupFlag::ThirdParty]
    );
    // binary plists decode; an undecodable one annotates only itself
    assert!(startup.user_agents[1].detail.as_ref().unwrap().is_error());
    let agent = startup.user_agents[0].detail.as_ref().unwrap().data().unwrap();
    assert_eq!(agent.plist.label.as_deref(), Some("com.example.agent"));
    assert_eq!(agent.plist.program.as_deref(), Some("/opt/example/agent"));
    assert_eq!(agent.flags, vec![StartupFlag::ThirdParty]);

    let kexts = report.kernel_extensions().unwrap().data().unwrap();
    let driver = &kexts[1];
    assert_eq!(driver.path, "/Library/Extensions/com.example.driver.kext");
    let detail = driver.detail.as_ref().unwrap();
    assert_eq!(detail.flags, vec![KextFlag::ThirdParty]);
    assert!(!detail.signature.data().unwrap().signed);
    assert!(detail.diagnostics.data().unwrap().starts_with("Diagnostics for"));
    assert_eq!(kexts[0].detail.as_ref().unwrap().flags, vec![KextFlag::Apple]);

    let policies = report.policies().unwrap().data().unwrap();
    assert_eq!(policies.file_vault, FileVaultState::On);
    assert_eq!(policies.secure_boot.source, SecureBootSource::Architecture);
    assert!(!policies.policy_files.is_empty());
    assert_eq!(policies.endpoints.len(), 3);

    let apps = report.applications().unwrap().data().unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].name, "Example");

    let configs = report.configurations().unwrap().data().unwrap();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].size, 10);

    let fds = report.file_descriptors().unwrap().data().unwrap();
    assert_eq!(fds.total_descriptors, 3);
    assert_eq!(fds.open_files, 2);
    assert_eq!(fds.network_sockets, 1);

    // the ps snapshot is shared by all startup items
    assert_eq!(runner.count("ps -axo"), 1);
}

#[tokio::test]
async fn secure_boot_stops_at_first_answer() {
    let dir = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|program, args| match program {
        "nvram" => Ok(CommandOutput::ok("SecureBootLevel\tfull\n")),
        _ => host(program, args),
    });
    let report = audit(dir.path(), runner.clone()).await.run_detailed_scan().await;

    let policies = report.policies().unwrap().data().unwrap();
    assert_eq!(policies.secure_boot.level, "Full Security");
    assert_eq!(policies.secure_boot.source, SecureBootSource::Nvram);
    assert_eq!(runner.count("system_profiler"), 0);
    assert_eq!(runner.count("uname"), 0);
}

#[tokio::test]
async fn report_serializes_findings_by_kind() {
    let dir = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|program, args| match program {
        "spctl" => Ok(CommandOutput::ok("")),
        _ => host(program, args),
    });
    let report = audit(dir.path(), runner).await.run_basic_scan().await;

    let json = serde_json::to_value(&report).unwrap();
    let findings = json["findings"].as_array().unwrap();
    assert_eq!(findings[1]["kind"], "gatekeeper");
    assert!(findings[1]["result"]["error"].is_string());
    assert_eq!(findings[2]["kind"], "firewall");
    assert_eq!(findings[2]["result"]["enabled"], true);
}

#[tokio::test]
async fn missing_firewall_key_keeps_admin_session() {
    let dir = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(admin_host);
    let (engine, pm) = granted_audit(dir.path(), runner.clone(), FakeElevator::new(true, true)).await;

    let report = engine.run_detailed_scan().await;

    assert_eq!(pm.state(), PrivilegeState::Granted);
    assert_eq!(runner.count("sudo -n defaults read"), 1);

    let firewall = report.firewall().unwrap().data().unwrap();
    let detail = firewall.detail.as_ref().unwrap();
    assert!(detail.exceptions.error().unwrap().contains("does not exist"));
    assert_eq!(detail.stealth_mode.data(), Some(&true));
    let rules = detail.packet_filter_rules.data().unwrap();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[1].action, PfAction::Block);

    assert_eq!(report.kernel_extensions().unwrap().data().unwrap().len(), 2);
}

#[tokio::test]
async fn failing_pf_query_keeps_admin_session() {
    let dir = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|program, args| match unwrap_sudo(program, args) {
        ("pfctl", _, true) => Ok(CommandOutput::failed(1, "pfctl: pf not enabled")),
        _ => admin_host(program, args),
    });
    let (engine, pm) = granted_audit(dir.path(), runner, FakeElevator::new(true, true)).await;

    let report = engine.run_detailed_scan().await;

    assert_eq!(pm.state(), PrivilegeState::Granted);
    let firewall = report.firewall().unwrap().data().unwrap();
    assert!(firewall.detail.as_ref().unwrap().packet_filter_rules.is_error());
}

#[tokio::test]
async fn expired_sudo_during_scan_demotes() {
    let dir = tempfile::tempdir().unwrap();
    let runner = FakeRunner::new(|program, args| match program {
        "sudo" => Ok(CommandOutput::failed(1, "sudo: a password is required")),
        _ => admin_host(program, args),
    });
    let elevator = FakeElevator::new(true, true);
    let (engine, pm) = granted_audit(dir.path(), runner, elevator.clone()).await;
    elevator.set_silent_ok(false);

    let report = engine.run_basic_scan().await;

    assert_eq!(pm.state(), PrivilegeState::Denied);
    assert_eq!(report.failed_probes(), vec![ProbeKind::KernelExtensions]);
}
