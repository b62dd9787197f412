//! Privilege session lifecycle: one-time elevation, privileged execution with
//! demotion on failure, and a silent renewal heartbeat.
//!
//! State machine: `Unknown → {Granted, Denied}`, `Granted → Denied` when a
//! verification or privileged command fails, `Denied → Granted` on elevation.
//! Every transition is persisted before the caller sees its result.

mod elevator;
mod session;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PrivilegeConfig;
use crate::error::{MonitorError, Result};
use crate::exec::{CommandOutput, CommandRunner};

pub use elevator::{Elevator, SudoElevator};
pub use session::{PrivilegeSession, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeState {
    /// No session has ever been recorded
    Unknown,
    Granted,
    Denied,
}

struct Inner {
    state: PrivilegeState,
    session: PrivilegeSession,
}

pub struct PrivilegeManager {
    store: SessionStore,
    elevator: Arc<dyn Elevator>,
    runner: Arc<dyn CommandRunner>,
    config: PrivilegeConfig,
    timeout: Duration,
    inner: Mutex<Inner>,
    /// Orders session writes; the file always ends with the latest state
    persist: tokio::sync::Mutex<()>,
    /// Single-flight guard: the first elevation attempt of this process
    elevation: OnceCell<PrivilegeState>,
}

impl PrivilegeManager {
    /// Load the persisted session and re-verify a previous grant without prompting.
    pub async fn initialize(
        store: SessionStore,
        elevator: Arc<dyn Elevator>,
        runner: Arc<dyn CommandRunner>,
        config: PrivilegeConfig,
        timeout: Duration,
    ) -> Self {
        let session = store.load().await;
        let state = match &session {
            None => PrivilegeState::Unknown,
            Some(s) if s.granted => PrivilegeState::Granted,
            Some(_) => PrivilegeState::Denied,
        };
        let manager = Self {
            store,
            elevator,
            runner,
            config,
            timeout,
            inner: Mutex::new(Inner {
                state,
                session: session.unwrap_or_default(),
            }),
            persist: tokio::sync::Mutex::new(()),
            elevation: OnceCell::new(),
        };

        if state == PrivilegeState::Granted {
            if manager.elevator.verify_silent().await {
                info!("admin privileges confirmed from cached session");
                manager.transition(PrivilegeState::Granted).await;
            } else {
                info!("cached admin privileges expired, will re-prompt when needed");
                manager.transition(PrivilegeState::Denied).await;
            }
        }
        manager
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> PrivilegeState {
        self.inner().state
    }

    pub fn is_granted(&self) -> bool {
        self.state() == PrivilegeState::Granted
    }

    pub fn session(&self) -> PrivilegeSession {
        self.inner().session.clone()
    }

    /// Whether this process has already attempted elevation
    pub fn elevation_requested(&self) -> bool {
        self.inner().session.requested_once
    }

    /// Update and persist the session. Persistence failures are logged, not raised.
    ///
    /// The in-memory state changes under the lock; the file is written after
    /// the lock is released.
    async fn transition(&self, to: PrivilegeState) -> PrivilegeState {
        let from = {
            let mut inner = self.inner();
            let from = inner.state;
            inner.state = to;
            inner.session.granted = to == PrivilegeState::Granted;
            if to == PrivilegeState::Granted {
                inner.session.last_verified_at = Some(Utc::now());
            }
            from
        };
        if from != to {
            info!(from = ?from, to = ?to, "privilege state changed");
        }

        let _writer = self.persist.lock().await;
        let session = self.session();
        if let Err(e) = self.store.save(&session).await {
            warn!(path = %self.store.path().display(), error = %e, "could not save privilege session");
        }
        to
    }

    /// Acquire elevation once per process lifetime.
    ///
    /// Concurrent callers share the single in-flight attempt; after it has
    /// completed, later calls return the current state without prompting.
    pub async fn request_elevation(&self) -> PrivilegeState {
        if self.is_granted() {
            return PrivilegeState::Granted;
        }
        let outcome = *self.elevation.get_or_init(|| self.elevate()).await;
        debug!(?outcome, "elevation attempt settled");
        self.state()
    }

    async fn elevate(&self) -> PrivilegeState {
        self.inner().session.requested_once = true;

        if self.elevator.verify_silent().await {
            info!("admin privileges confirmed");
            return self.grant().await;
        }

        info!("requesting admin privileges (one-time prompt)");
        if self.elevator.prompt().await {
            self.grant().await
        } else {
            info!("running in limited mode, some probes require admin privileges");
            self.transition(PrivilegeState::Denied).await
        }
    }

    async fn grant(&self) -> PrivilegeState {
        self.transition(PrivilegeState::Granted).await;
        if self.config.extend_window_on_grant {
            if let Err(e) = self
                .extend_elevation_window(self.config.elevation_window_minutes)
                .await
            {
                warn!(error = %e, "could not extend elevation window");
            }
        }
        self.state()
    }

    /// Write a sudoers drop-in raising the credential cache timeout.
    ///
    /// This is the only write to system configuration the monitor performs and
    /// it is never done implicitly unless `extend_window_on_grant` is set.
    pub async fn extend_elevation_window(&self, minutes: u32) -> Result<()> {
        if !self.is_granted() {
            return Err(MonitorError::PrivilegeRequired {
                command: "sudoers timeout".to_string(),
                reason: "elevation has not been granted".to_string(),
            });
        }
        let path = self.config.sudoers_dropin.display().to_string();
        let script = format!(
            "printf 'Defaults timestamp_timeout={minutes}\\n' > '{path}' && chmod 0440 '{path}'"
        );
        self.run_privileged("sh", &["-c", &script]).await?;
        info!(minutes, path = %path, "elevation window extended");
        Ok(())
    }

    /// Run a command elevated when granted, unprivileged otherwise.
    ///
    /// When an elevated run fails, a silent check decides whether elevation
    /// itself is gone; only then is the session demoted to `Denied`
    /// (persisted). A tool that merely exits non-zero under a working `sudo`
    /// leaves the session granted. The failure is returned either way;
    /// callers own their fallback.
    pub async fn run_privileged(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        if self.is_granted() {
            let (sudo, argv) = self.elevator.elevated_command(program, args);
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            let res = self
                .runner
                .run(&sudo, &argv, self.timeout)
                .await
                .and_then(|out| out.into_success(program));
            if let Err(e) = &res {
                if self.elevator.verify_silent().await {
                    debug!(program, error = %e, "privileged command failed, elevation still valid");
                } else {
                    warn!(program, error = %e, "elevation lost, dropping admin session");
                    self.transition(PrivilegeState::Denied).await;
                }
            }
            return res;
        }

        match self.runner.run(program, args, self.timeout).await {
            Ok(out) if out.success() => Ok(out),
            Ok(out) => Err(MonitorError::PrivilegeRequired {
                command: program.to_string(),
                reason: out.stderr.trim().to_string(),
            }),
            Err(e) => Err(MonitorError::PrivilegeRequired {
                command: program.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// One heartbeat: silently re-verify while granted, demote on failure.
    pub async fn renew_once(&self) -> PrivilegeState {
        if !self.is_granted() {
            return self.state();
        }
        if self.elevator.verify_silent().await {
            debug!("admin session renewed");
            self.transition(PrivilegeState::Granted).await
        } else {
            warn!("admin session expired");
            self.transition(PrivilegeState::Denied).await
        }
    }

    /// Start the renewal heartbeat on the current runtime.
    pub fn spawn_renewal(self: &Arc<Self>) -> RenewalHandle {
        let period = self.config.renewal_interval();
        let manager = Arc::clone(self);
        let (stop, mut stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        manager.renew_once().await;
                    }
                }
            }
            debug!("renewal heartbeat stopped");
        });
        RenewalHandle {
            stop: Some(stop),
            task,
        }
    }
}

/// Owner of the renewal task. Dropping it also stops the heartbeat.
pub struct RenewalHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RenewalHandle {
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "renewal task ended abnormally");
        }
    }
}
