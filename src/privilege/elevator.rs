//! How elevation is checked, prompted for and applied to a command.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::exec::CommandRunner;

#[async_trait]
pub trait Elevator: Send + Sync {
    /// Whether elevated execution works right now without prompting
    async fn verify_silent(&self) -> bool;

    /// Ask the user for elevation interactively
    async fn prompt(&self) -> bool;

    /// Program and arguments that run `program args…` elevated, never prompting
    fn elevated_command(&self, program: &str, args: &[&str]) -> (String, Vec<String>);
}

/// `sudo`-based elevation
pub struct SudoElevator {
    runner: Arc<dyn CommandRunner>,
    sudo: String,
    check_timeout: Duration,
    prompt_timeout: Duration,
}

impl SudoElevator {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        sudo: impl Into<String>,
        check_timeout: Duration,
        prompt_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            sudo: sudo.into(),
            check_timeout,
            prompt_timeout,
        }
    }
}

#[async_trait]
impl Elevator for SudoElevator {
    async fn verify_silent(&self) -> bool {
        match self
            .runner
            .run(&self.sudo, &["-n", "true"], self.check_timeout)
            .await
        {
            Ok(out) => out.success(),
            Err(e) => {
                debug!(error = %e, "silent privilege check failed");
                false
            }
        }
    }

    async fn prompt(&self) -> bool {
        // The password prompt needs the terminal, so this bypasses the capturing runner.
        let child = Command::new(&self.sudo)
            .arg("-v")
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                warn!(sudo = %self.sudo, error = %e, "cannot launch elevation prompt");
                return false;
            }
        };
        match tokio::time::timeout(self.prompt_timeout, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!(error = %e, "elevation prompt failed");
                false
            }
            Err(_) => {
                warn!(timeout_secs = self.prompt_timeout.as_secs(), "elevation prompt timed out");
                false
            }
        }
    }

    fn elevated_command(&self, program: &str, args: &[&str]) -> (String, Vec<String>) {
        let mut argv = Vec::with_capacity(args.len() + 2);
        argv.push("-n".to_string());
        argv.push(program.to_string());
        argv.extend(args.iter().map(|a| (*a).to_string()));
        (self.sudo.clone(), argv)
    }
}
