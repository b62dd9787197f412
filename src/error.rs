use std::time::Duration;

use thiserror::Error;

/// Result type alias for monitor operations
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors raised while running diagnostic probes
#[derive(Error, Debug)]
pub enum MonitorError {
    /// The tool could not be started (missing, not executable)
    #[error("failed to launch {program}: {source}")]
    LaunchFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool did not finish within its bound and was killed
    #[error("{program} timed out after {}s", timeout.as_secs())]
    Timeout { program: String, timeout: Duration },

    /// The tool ran but reported failure
    #[error("{program} exited with status {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Elevation was needed but is not available
    #[error("{command} requires admin privileges: {reason}")]
    PrivilegeRequired { command: String, reason: String },

    /// One security probe failed; recorded in the report, never propagated past it
    #[error("{probe} probe failed: {reason}")]
    ProbeFailure { probe: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MonitorError {
    pub fn probe(probe: &'static str, reason: impl Into<String>) -> Self {
        Self::ProbeFailure {
            probe,
            reason: reason.into(),
        }
    }
}
