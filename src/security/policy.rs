//! Disk encryption, secure boot and presence of platform policy stores.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::SecurityAuditEngine;
use crate::error::Result;

/// Platform files whose presence is reported, not their content
const POLICY_FILES: &[(&str, &str)] = &[
    ("FileVault master keychain", "/Library/Keychains/FileVaultMaster.keychain"),
    ("System version", "/System/Library/CoreServices/SystemVersion.plist"),
    ("Authorization database", "/var/db/auth.db"),
    ("System keychains", "/System/Library/Keychains"),
    ("System policy database", "/var/db/SystemPolicy"),
    ("Security framework", "/System/Library/Frameworks/Security.framework"),
];

/// Services macOS consults to validate certificates, notarization and updates
const SECURITY_ENDPOINTS: &[(&str, &str, &str)] = &[
    (
        "Apple Certificate Authority",
        "https://www.apple.com/certificateauthority/",
        "Certificate validation endpoint",
    ),
    (
        "Gatekeeper Notarization",
        "https://api.apple-cloudkit.com",
        "App notarization verification",
    ),
    (
        "System Software Updates",
        "https://swscan.apple.com",
        "Software update verification",
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileVaultState {
    On,
    Off,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecureBootSource {
    Nvram,
    PlatformProfile,
    Architecture,
    Undetermined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureBootStatus {
    pub level: String,
    pub source: SecureBootSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFile {
    pub name: String,
    pub path: String,
    pub present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEndpoint {
    pub name: String,
    pub url: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicies {
    pub file_vault: FileVaultState,
    pub secure_boot: SecureBootStatus,
    pub policy_files: Vec<PolicyFile>,
    /// Static reference list; not probed
    pub endpoints: Vec<SecurityEndpoint>,
}

pub fn security_endpoints() -> Vec<SecurityEndpoint> {
    SECURITY_ENDPOINTS
        .iter()
        .map(|(name, url, description)| SecurityEndpoint {
            name: (*name).to_string(),
            url: (*url).to_string(),
            description: (*description).to_string(),
        })
        .collect()
}

pub fn parse_fdesetup(output: &str) -> FileVaultState {
    if output.contains("FileVault is On") {
        FileVaultState::On
    } else if output.contains("FileVault is Off") {
        FileVaultState::Off
    } else {
        FileVaultState::Unknown
    }
}

/// `SecureBootLevel` from `nvram -p`; `None` when the variable is absent.
pub fn parse_nvram_secure_boot(output: &str) -> Option<String> {
    let line = output.lines().find(|l| l.contains("SecureBootLevel"))?;
    let value = line
        .split_once("SecureBootLevel")
        .map(|(_, v)| v.trim())
        .unwrap_or_default();
    let level = match value {
        "" => "Enabled".to_string(),
        "full" | "Full" => "Full Security".to_string(),
        "medium" | "Medium" => "Reduced Security".to_string(),
        "none" | "None" => "Permissive Security".to_string(),
        other => format!("Level: {other}"),
    };
    Some(level)
}

/// `Secure Boot: <level>` from the bridge/platform profile.
pub fn parse_profile_secure_boot(output: &str) -> Option<String> {
    let line = output.lines().find(|l| l.contains("Secure Boot"))?;
    let level = line
        .split_once(':')
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
        .unwrap_or("Enabled");
    Some(level.to_string())
}

impl SecurityAuditEngine {
    pub(super) async fn security_policies(&self) -> Result<SecurityPolicies> {
        let file_vault = match self.run_checked("fdesetup", &["status"]).await {
            Ok(out) => parse_fdesetup(&out),
            Err(e) => {
                warn!(error = %e, "could not determine FileVault state");
                FileVaultState::Unknown
            }
        };
        let secure_boot = self.secure_boot().await;

        let mut policy_files = Vec::with_capacity(POLICY_FILES.len());
        for (name, path) in POLICY_FILES {
            policy_files.push(PolicyFile {
                name: (*name).to_string(),
                path: (*path).to_string(),
                present: tokio::fs::try_exists(Path::new(path)).await.unwrap_or(false),
            });
        }

        Ok(SecurityPolicies {
            file_vault,
            secure_boot,
            policy_files,
            endpoints: security_endpoints(),
        })
    }

    /// First source that answers wins; later sources are not consulted.
    async fn secure_boot(&self) -> SecureBootStatus {
        match self.run_checked("nvram", &["-p"]).await {
            Ok(out) => {
                if let Some(level) = parse_nvram_secure_boot(&out) {
                    return SecureBootStatus {
                        level,
                        source: SecureBootSource::Nvram,
                    };
                }
            }
            Err(e) => debug!(error = %e, "nvram secure boot lookup failed"),
        }

        match self.run_checked("system_profiler", &["SPiBridgeDataType"]).await {
            Ok(out) => {
                if let Some(level) = parse_profile_secure_boot(&out) {
                    return SecureBootStatus {
                        level,
                        source: SecureBootSource::PlatformProfile,
                    };
                }
            }
            Err(e) => debug!(error = %e, "platform profile secure boot lookup failed"),
        }

        match self.run_checked("uname", &["-m"]).await {
            Ok(out) if out.contains("arm64") => {
                return SecureBootStatus {
                    level: "Enabled (Apple Silicon)".into(),
                    source: SecureBootSource::Architecture,
                };
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "architecture lookup failed"),
        }

        SecureBootStatus {
            level: "Unknown".into(),
            source: SecureBootSource::Undetermined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filevault_states() {
        assert_eq!(parse_fdesetup("FileVault is On.\n"), FileVaultState::On);
        assert_eq!(parse_fdesetup("FileVault is Off.\n"), FileVaultState::Off);
        assert_eq!(parse_fdesetup("Error: ...\n"), FileVaultState::Unknown);
    }

    #[test]
    fn nvram_levels() {
        assert_eq!(
            parse_nvram_secure_boot("boot-args\t\nSecureBootLevel\tfull\n").as_deref(),
            Some("Full Security")
        );
        assert_eq!(
            parse_nvram_secure_boot("SecureBootLevel\tmedium\n").as_deref(),
            Some("Reduced Security")
        );
        assert_eq!(
            parse_nvram_secure_boot("SecureBootLevel\n").as_deref(),
            Some("Enabled")
        );
        assert_eq!(parse_nvram_secure_boot("boot-args\t-v\n"), None);
    }

    #[test]
    fn endpoints_are_https() {
        let endpoints = security_endpoints();
        assert_eq!(endpoints.len(), 3);
        assert!(endpoints.iter().all(|e| e.url.starts_with("https://")));
    }

    #[test]
    fn profile_level() {
        let out = "Controller Information:\n\n      Model Name: Apple T2 Security Chip\n      Secure Boot: Full Security\n";
        assert_eq!(parse_profile_secure_boot(out).as_deref(), Some("Full Security"));
        assert_eq!(parse_profile_secure_boot("Model Name: Apple T2\n"), None);
    }
}
