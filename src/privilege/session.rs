//! Persisted privilege session record.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

/// Elevation state as known to this process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivilegeSession {
    pub granted: bool,
    /// Set once per process lifetime when an elevation attempt starts
    #[serde(skip)]
    pub requested_once: bool,
    pub last_verified_at: Option<DateTime<Utc>>,
}

/// JSON file holding the session between runs
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored session. `None` when nothing has been stored yet;
    /// an unreadable or corrupt file is treated as absent.
    pub async fn load(&self) -> Option<PrivilegeSession> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read privilege session");
                return None;
            }
        };
        match serde_json::from_str(&data) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring corrupt privilege session");
                None
            }
        }
    }

    pub async fn save(&self, session: &PrivilegeSession) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let data = serde_json::to_string_pretty(session)?;
        tokio::fs::write(&self.path, data).await?;
        Ok(())
    }
}
