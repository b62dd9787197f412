//! Launch daemons, launch agents and login items.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{ProbeOutcome, SecurityAuditEngine};
use crate::config::expand_home;
use crate::error::{MonitorError, Result};
use crate::parse::{collect_records, columns, ParsedLine};

const LOGIN_ITEMS_SCRIPT: &str =
    "tell application \"System Events\" to get the name of every login item";

/// Program paths under these prefixes ship with the OS
const SYSTEM_PREFIXES: &[&str] = &[
    "/System/",
    "/usr/bin/",
    "/usr/sbin/",
    "/usr/libexec/",
    "/usr/lib/",
    "/bin/",
    "/sbin/",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupKind {
    Daemon,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartupFlag {
    AutoStart,
    Persistent,
    SystemLevel,
    RootDaemon,
    ThirdParty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupItem {
    pub name: String,
    pub path: String,
    pub kind: StartupKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<ProbeOutcome<StartupItemDetail>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupItems {
    pub system_daemons: Vec<StartupItem>,
    pub user_agents: Vec<StartupItem>,
    pub login_items: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchdPlist {
    pub label: Option<String>,
    /// `Program`, or the first `ProgramArguments` entry
    pub program: Option<String>,
    pub run_at_load: bool,
    pub keep_alive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningProcess {
    pub pid: u32,
    pub command: String,
    pub args: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupItemDetail {
    #[serde(flatten)]
    pub plist: LaunchdPlist,
    pub running: Option<RunningProcess>,
    pub flags: Vec<StartupFlag>,
}

/// `true`, or a conditional `<dict>` (launchd still relaunches the job)
fn keep_alive(value: &plist::Value) -> bool {
    match value {
        plist::Value::Boolean(b) => *b,
        plist::Value::Dictionary(_) => true,
        _ => false,
    }
}

fn non_empty(value: Option<&plist::Value>) -> Option<String> {
    value
        .and_then(plist::Value::as_string)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Pull the launchd keys that matter from an XML or binary property list.
///
/// Only keys of the top-level dictionary are consulted.
pub fn parse_launchd_plist(raw: &[u8]) -> std::result::Result<LaunchdPlist, String> {
    let value = plist::Value::from_reader(Cursor::new(raw)).map_err(|e| e.to_string())?;
    let dict = value
        .as_dictionary()
        .ok_or_else(|| "property list root is not a dictionary".to_string())?;

    let program = non_empty(dict.get("Program")).or_else(|| {
        dict.get("ProgramArguments")
            .and_then(plist::Value::as_array)
            .and_then(|args| non_empty(args.first()))
    });
    Ok(LaunchdPlist {
        label: non_empty(dict.get("Label")),
        program,
        run_at_load: dict
            .get("RunAtLoad")
            .and_then(plist::Value::as_boolean)
            .unwrap_or(false),
        keep_alive: dict.get("KeepAlive").map(keep_alive).unwrap_or(false),
    })
}

pub fn startup_flags(plist: &LaunchdPlist, path: &str) -> Vec<StartupFlag> {
    let mut flags = Vec::new();
    if plist.run_at_load {
        flags.push(StartupFlag::AutoStart);
    }
    if plist.keep_alive {
        flags.push(StartupFlag::Persistent);
    }
    if path.starts_with("/System/") {
        flags.push(StartupFlag::SystemLevel);
    }
    if path.contains("/Library/LaunchDaemons/") {
        flags.push(StartupFlag::RootDaemon);
    }
    if let Some(program) = &plist.program {
        if !SYSTEM_PREFIXES.iter().any(|p| program.starts_with(p)) {
            flags.push(StartupFlag::ThirdParty);
        }
    }
    flags
}

fn parse_ps_snapshot_line(line: &str) -> ParsedLine<RunningProcess> {
    let cols = columns(line);
    if cols.is_empty() || cols[0] == "PID" {
        return ParsedLine::Skip;
    }
    if cols.len() < 2 {
        return ParsedLine::Malformed(format!("short ps row {line:?}"));
    }
    let Ok(pid) = cols[0].parse::<u32>() else {
        return ParsedLine::Malformed(format!("bad pid {:?}", cols[0]));
    };
    ParsedLine::Record(RunningProcess {
        pid,
        command: cols[1].to_string(),
        args: cols[2..].join(" "),
    })
}

fn find_running<'a>(processes: &'a [RunningProcess], needle: &str) -> Option<&'a RunningProcess> {
    if needle.is_empty() {
        return None;
    }
    processes
        .iter()
        .find(|p| p.command.contains(needle) || p.args.contains(needle))
}

/// Plist files directly inside `dir`; a missing or unreadable directory is an error.
fn list_plists(dir: &Path, kind: StartupKind) -> std::io::Result<Vec<StartupItem>> {
    let mut items = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry?;
        if entry.path().extension().and_then(|e| e.to_str()) != Some("plist") {
            continue;
        }
        items.push(StartupItem {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path().display().to_string(),
            kind,
            detail: None,
        });
    }
    Ok(items)
}

fn scan_launch_dirs(dirs: &[PathBuf], kind: StartupKind) -> Vec<StartupItem> {
    let mut items = Vec::new();
    for dir in dirs {
        match list_plists(dir, kind) {
            Ok(found) => items.extend(found),
            Err(e) => warn!(dir = %dir.display(), error = %e, "cannot read launch directory"),
        }
    }
    items
}

async fn describe_item(item: &StartupItem, processes: &[RunningProcess]) -> ProbeOutcome<StartupItemDetail> {
    let raw = match tokio::fs::read(&item.path).await {
        Ok(raw) => raw,
        Err(e) => return ProbeOutcome::from_result(Err(e.into())),
    };
    let plist = match parse_launchd_plist(&raw) {
        Ok(p) => p,
        Err(reason) => return ProbeOutcome::Failed { error: reason },
    };
    let fallback = item.name.trim_end_matches(".plist");
    let needle = plist.label.as_deref().unwrap_or(fallback);
    let running = find_running(processes, needle).cloned();
    let flags = startup_flags(&plist, &item.path);
    ProbeOutcome::Data(StartupItemDetail {
        plist,
        running,
        flags,
    })
}

impl SecurityAuditEngine {
    pub(super) async fn startup_items(&self) -> Result<StartupItems> {
        let daemon_dirs: Vec<PathBuf> = self.config.launch_daemon_dirs.iter().map(|d| expand_home(d)).collect();
        let agent_dirs: Vec<PathBuf> = self.config.launch_agent_dirs.iter().map(|d| expand_home(d)).collect();
        let (system_daemons, user_agents) = tokio::task::spawn_blocking(move || {
            (
                scan_launch_dirs(&daemon_dirs, StartupKind::Daemon),
                scan_launch_dirs(&agent_dirs, StartupKind::Agent),
            )
        })
        .await
        .map_err(|e| MonitorError::probe("startup_items", e.to_string()))?;

        Ok(StartupItems {
            system_daemons,
            user_agents,
            login_items: self.login_items().await,
        })
    }

    /// Login items via System Events; unavailable scripting yields none.
    async fn login_items(&self) -> Vec<String> {
        match self.run_checked("osascript", &["-e", LOGIN_ITEMS_SCRIPT]).await {
            Ok(out) => out
                .trim()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Err(e) => {
                debug!(error = %e, "login items unavailable");
                Vec::new()
            }
        }
    }

    /// One process snapshot shared by every startup item lookup
    async fn process_snapshot(&self) -> Vec<RunningProcess> {
        match self.run_checked("ps", &["-axo", "pid,comm,args"]).await {
            Ok(out) => collect_records("ps -axo", out.lines().map(parse_ps_snapshot_line)),
            Err(e) => {
                warn!(error = %e, "process snapshot failed, running state unknown");
                Vec::new()
            }
        }
    }

    pub(super) async fn startup_items_detailed(&self) -> Result<StartupItems> {
        let mut items = self.startup_items().await?;
        let processes = self.process_snapshot().await;

        let limit = self.enrichment_limit();
        let daemons: Vec<_> = stream::iter(&items.system_daemons)
            .map(|i| describe_item(i, &processes))
            .buffered(limit)
            .collect()
            .await;
        let agents: Vec<_> = stream::iter(&items.user_agents)
            .map(|i| describe_item(i, &processes))
            .buffered(limit)
            .collect()
            .await;
        for (item, detail) in items.system_daemons.iter_mut().zip(daemons) {
            item.detail = Some(detail);
        }
        for (item, detail) in items.user_agents.iter_mut().zip(agents) {
            item.detail = Some(detail);
        }
        Ok(items)
    }
}
