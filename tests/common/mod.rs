//! Scripted runner and elevator shared by the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gateway_monitor::config::{MonitorConfig, PrivilegeConfig};
use gateway_monitor::error::Result;
use gateway_monitor::exec::{CommandOutput, CommandRunner};
use gateway_monitor::privilege::{Elevator, PrivilegeManager, SessionStore};

pub const TIMEOUT: Duration = Duration::from_secs(10);

type Handler = dyn Fn(&str, &[&str]) -> Result<CommandOutput> + Send + Sync;

/// Answers every command through one closure and records the command lines.
pub struct FakeRunner {
    handler: Box<Handler>,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new(
        handler: impl Fn(&str, &[&str]) -> Result<CommandOutput> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded command lines containing `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[&str], _timeout: Duration) -> Result<CommandOutput> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(line);
        (self.handler)(program, args)
    }
}

/// Strip the `sudo -n` wrapper the fake elevator adds.
pub fn unwrap_sudo<'a>(program: &'a str, args: &'a [&'a str]) -> (&'a str, &'a [&'a str], bool) {
    match (program, args) {
        ("sudo", ["-n", inner, rest @ ..]) => (*inner, rest, true),
        _ => (program, args, false),
    }
}

pub struct FakeElevator {
    pub silent_ok: AtomicBool,
    pub prompt_grants: bool,
    pub prompt_delay: Duration,
    pub prompts: AtomicUsize,
    pub verifications: AtomicUsize,
}

impl FakeElevator {
    pub fn new(silent_ok: bool, prompt_grants: bool) -> Arc<Self> {
        Arc::new(Self {
            silent_ok: AtomicBool::new(silent_ok),
            prompt_grants,
            prompt_delay: Duration::ZERO,
            prompts: AtomicUsize::new(0),
            verifications: AtomicUsize::new(0),
        })
    }

    pub fn slow_prompt(prompt_grants: bool, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            silent_ok: AtomicBool::new(false),
            prompt_grants,
            prompt_delay: delay,
            prompts: AtomicUsize::new(0),
            verifications: AtomicUsize::new(0),
        })
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn set_silent_ok(&self, ok: bool) {
        self.silent_ok.store(ok, Ordering::SeqCst);
    }
}

#[async_trait]
impl Elevator for FakeElevator {
    async fn verify_silent(&self) -> bool {
        self.verifications.fetch_add(1, Ordering::SeqCst);
        self.silent_ok.load(Ordering::SeqCst)
    }

    async fn prompt(&self) -> bool {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if !self.prompt_delay.is_zero() {
            tokio::time::sleep(self.prompt_delay).await;
        }
        if self.prompt_grants {
            self.silent_ok.store(true, Ordering::SeqCst);
        }
        self.prompt_grants
    }

    fn elevated_command(&self, program: &str, args: &[&str]) -> (String, Vec<String>) {
        let mut argv = vec!["-n".to_string(), program.to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        ("sudo".to_string(), argv)
    }
}

pub fn privilege_config(dir: &Path) -> PrivilegeConfig {
    PrivilegeConfig {
        session_path: Some(dir.join("session.json")),
        sudoers_dropin: dir.join("sudoers-timeout"),
        ..PrivilegeConfig::default()
    }
}

pub fn monitor_config(dir: &Path) -> MonitorConfig {
    MonitorConfig {
        privilege: privilege_config(dir),
        ..MonitorConfig::default()
    }
}

pub async fn manager(
    dir: &Path,
    runner: Arc<FakeRunner>,
    elevator: Arc<FakeElevator>,
) -> Arc<PrivilegeManager> {
    let config = privilege_config(dir);
    let store = SessionStore::new(config.session_file());
    Arc::new(PrivilegeManager::initialize(store, elevator, runner, config, TIMEOUT).await)
}
