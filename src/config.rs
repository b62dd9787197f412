//! Monitor configuration. Loaded from JSON; every section has defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Timeouts applied to every external tool
    pub probes: ProbeConfig,
    /// Elevation, session persistence and renewal
    pub privilege: PrivilegeConfig,
    /// Process/network collection and caching
    pub collection: CollectionConfig,
    /// Security audit paths and limits
    pub security: SecurityConfig,
    /// Logging
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivilegeConfig {
    pub sudo_program: String,
    /// Session file; defaults to the per-user config directory
    pub session_path: Option<PathBuf>,
    /// Silent re-verification period while granted
    pub renewal_interval_secs: u64,
    /// Upper bound for the interactive prompt
    pub prompt_timeout_secs: u64,
    /// Write the sudoers timeout drop-in right after a grant
    pub extend_window_on_grant: bool,
    pub elevation_window_minutes: u32,
    pub sudoers_dropin: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Lifetime of the per-process bandwidth snapshot
    pub usage_cache_ttl_ms: u64,
    /// Ask for elevation the first time connections are listed
    pub request_elevation: bool,
    /// Poll interval for the CLI watch loop (seconds, 0 = default of 5)
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub launch_daemon_dirs: Vec<PathBuf>,
    /// `~` is expanded to the user's home directory
    pub launch_agent_dirs: Vec<PathBuf>,
    pub application_dirs: Vec<PathBuf>,
    pub configuration_files: Vec<PathBuf>,
    /// Cap on the open-file list in the descriptor inventory
    pub max_file_list: usize,
    /// Per-item lookups (kexts, launch plists) allowed in flight at once
    pub enrichment_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 10,
        }
    }
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            sudo_program: "sudo".to_string(),
            session_path: None,
            renewal_interval_secs: 240,
            prompt_timeout_secs: 120,
            extend_window_on_grant: false,
            elevation_window_minutes: 60,
            sudoers_dropin: PathBuf::from("/etc/sudoers.d/gateway-monitor-timeout"),
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            usage_cache_ttl_ms: 5_000,
            request_elevation: true,
            poll_interval_secs: 0,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            launch_daemon_dirs: vec![
                PathBuf::from("/System/Library/LaunchDaemons"),
                PathBuf::from("/Library/LaunchDaemons"),
            ],
            launch_agent_dirs: vec![
                PathBuf::from("/System/Library/LaunchAgents"),
                PathBuf::from("/Library/LaunchAgents"),
                PathBuf::from("~/Library/LaunchAgents"),
            ],
            application_dirs: vec![
                PathBuf::from("/Applications"),
                PathBuf::from("/System/Applications"),
                PathBuf::from("~/Applications"),
            ],
            configuration_files: vec![
                PathBuf::from("/etc/pf.conf"),
                PathBuf::from("/etc/hosts"),
                PathBuf::from("/etc/ssh/ssh_config"),
                PathBuf::from("/etc/ssh/sshd_config"),
            ],
            max_file_list: 1_000,
            enrichment_concurrency: 4,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

impl PrivilegeConfig {
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs.max(1))
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs.max(1))
    }

    /// Resolved session file location
    pub fn session_file(&self) -> PathBuf {
        if let Some(p) = &self.session_path {
            return expand_home(p);
        }
        if let Some(dir) = dirs::config_dir() {
            return dir.join("gateway-monitor").join("session.json");
        }
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".gateway-monitor")
            .join("session.json")
    }
}

impl CollectionConfig {
    pub fn usage_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.usage_cache_ttl_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        let secs = if self.poll_interval_secs == 0 {
            5
        } else {
            self.poll_interval_secs
        };
        Duration::from_secs(secs)
    }
}

/// Expand a leading `~` to the home directory; other paths are returned as-is
pub fn expand_home(path: &std::path::Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

impl MonitorConfig {
    /// Load from a JSON file. A missing file silently yields defaults; an
    /// unreadable or invalid one is reported and also yields defaults.
    pub fn load(path: &std::path::Path) -> Self {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read config, using defaults");
                return Self::default();
            }
        };
        serde_json::from_str(&data).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            Self::default()
        })
    }
}
