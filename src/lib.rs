//! gateway-monitor: host telemetry and security posture collection for macOS.
//!
//! Modular structure:
//! - [`exec`]: External tool execution with timeouts
//! - [`privilege`]: Elevation session, privileged execution, renewal heartbeat
//! - [`collectors`]: Processes, sockets, bandwidth, per-process detail, host network state
//! - [`security`]: Concurrent security posture probes with per-probe isolation
//! - [`monitor`]: Composition root and request/response surface
//! - [`logging`]: Structured logging to stderr

pub mod collectors;
pub mod config;
pub mod error;
pub mod exec;
pub mod logging;
pub mod monitor;
pub mod parse;
pub mod privilege;
pub mod security;

pub use collectors::CollectionEngine;
pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use exec::{CommandOutput, CommandRunner, SystemRunner};
pub use logging::StructuredLogger;
pub use monitor::Monitor;
pub use privilege::{PrivilegeManager, PrivilegeState};
pub use security::{ProbeOutcome, SecurityAuditEngine, SecurityReport};
