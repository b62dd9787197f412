//! Gatekeeper, application firewall and System Integrity Protection.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ProbeOutcome, SecurityAuditEngine};
use crate::error::{MonitorError, Result};
use crate::exec::CommandOutput;

const ALF_DOMAIN: &str = "/Library/Preferences/com.apple.alf";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatekeeperStatus {
    pub enabled: bool,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipStatus {
    pub enabled: bool,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallStatus {
    pub enabled: bool,
    /// 0 off, 1 on for specific services, 2 essential services only
    pub global_state: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<FirewallDetail>,
}

/// Each setting is read on its own; a missing one does not hide the others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallDetail {
    pub stealth_mode: ProbeOutcome<bool>,
    pub logging: ProbeOutcome<bool>,
    pub exceptions: ProbeOutcome<Vec<String>>,
    pub packet_filter_rules: ProbeOutcome<Vec<PfRule>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PfAction {
    Pass,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PfRule {
    pub rule: String,
    pub action: PfAction,
}

/// `spctl` reports on either stream depending on the macOS release.
fn combined_text(out: &CommandOutput) -> String {
    format!("{}{}", out.stdout, out.stderr).trim().to_string()
}

pub fn parse_spctl(out: &CommandOutput) -> Result<GatekeeperStatus> {
    let status = combined_text(out);
    if status.is_empty() {
        return Err(MonitorError::probe("gatekeeper", "spctl produced no output"));
    }
    Ok(GatekeeperStatus {
        enabled: status.contains("assessments enabled"),
        status,
    })
}

/// Only the `status:` line decides; `Custom Configuration` sub-lines do not.
pub fn parse_sip(out: &CommandOutput) -> Result<SipStatus> {
    let text = combined_text(out);
    if text.is_empty() {
        return Err(MonitorError::probe("system_integrity_protection", "csrutil produced no output"));
    }
    let status_line = text
        .lines()
        .find(|l| l.contains("status:"))
        .unwrap_or(text.as_str())
        .to_lowercase();
    Ok(SipStatus {
        enabled: status_line.contains("enabled"),
        status: text,
    })
}

/// `pfctl -sr` rules, keeping only pass/block lines.
pub fn parse_pf_rules(output: &str) -> Vec<PfRule> {
    output
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let action = if line.starts_with("pass") {
                PfAction::Pass
            } else if line.starts_with("block") {
                PfAction::Block
            } else {
                return None;
            };
            Some(PfRule {
                rule: line.to_string(),
                action,
            })
        })
        .collect()
}

fn parse_flag(value: &str) -> bool {
    value.trim() == "1"
}

/// Application paths and bundle ids from the `exceptions` array dump
pub fn parse_alf_exceptions(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| l.contains("bundleid") || l.contains("path"))
        .map(String::from)
        .collect()
}

impl SecurityAuditEngine {
    pub(super) async fn gatekeeper_status(&self) -> Result<GatekeeperStatus> {
        let out = self.runner.run("spctl", &["--status"], self.timeout).await?;
        parse_spctl(&out)
    }

    pub(super) async fn sip_status(&self) -> Result<SipStatus> {
        let out = self.runner.run("csrutil", &["status"], self.timeout).await?;
        parse_sip(&out)
    }

    /// Read one firewall preference, retrying elevated when the plain read fails.
    async fn read_alf(&self, key: &str) -> Result<String> {
        let args = ["read", ALF_DOMAIN, key];
        match self.run_checked("defaults", &args).await {
            Ok(v) => Ok(v),
            Err(e) if self.privilege.is_granted() => {
                debug!(key, error = %e, "firewall preference unreadable, retrying elevated");
                Ok(self.privilege.run_privileged("defaults", &args).await?.stdout)
            }
            Err(e) => Err(e),
        }
    }

    pub(super) async fn firewall_status(&self, detailed: bool) -> Result<FirewallStatus> {
        let raw = self.read_alf("globalstate").await?;
        let global_state: i32 = raw.trim().parse().map_err(|_| {
            MonitorError::probe("firewall", format!("unexpected globalstate {:?}", raw.trim()))
        })?;
        let detail = if detailed {
            Some(self.firewall_detail().await)
        } else {
            None
        };
        Ok(FirewallStatus {
            enabled: global_state > 0,
            global_state,
            detail,
        })
    }

    async fn firewall_detail(&self) -> FirewallDetail {
        let (stealth, logging, exceptions, rules) = tokio::join!(
            self.read_alf("stealthenabled"),
            self.read_alf("loggingenabled"),
            self.read_alf("exceptions"),
            self.privilege.run_privileged("pfctl", &["-sr"]),
        );
        FirewallDetail {
            stealth_mode: ProbeOutcome::from_result(stealth.map(|v| parse_flag(&v))),
            logging: ProbeOutcome::from_result(logging.map(|v| parse_flag(&v))),
            exceptions: ProbeOutcome::from_result(exceptions.map(|v| parse_alf_exceptions(&v))),
            packet_filter_rules: ProbeOutcome::from_result(
                rules.map(|out| parse_pf_rules(&out.stdout)),
            ),
        }
    }
}
