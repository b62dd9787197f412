//! Security posture audit.
//!
//! Every probe is independent: they are issued together, each one settles into
//! either data or an isolated error, and the report is assembled only after
//! all of them have settled. A failing probe never voids its siblings.

mod inventory;
mod kext;
mod policy;
mod startup;
mod status;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SecurityConfig;
use crate::error::Result;
use crate::exec::CommandRunner;
use crate::privilege::PrivilegeManager;

pub use inventory::{
    build_fd_inventory, categorize_path, Application, ConfigFile, FileCategory,
    FileDescriptorInventory, OpenFileRef,
};
pub use kext::{
    kext_path_for_bundle, parse_codesign, parse_kextstat, CodeSignature, KernelExtension,
    KextDetail, KextFlag,
};
pub use policy::{
    parse_fdesetup, parse_nvram_secure_boot, parse_profile_secure_boot, security_endpoints,
    FileVaultState, PolicyFile, SecureBootSource, SecureBootStatus, SecurityEndpoint,
    SecurityPolicies,
};
pub use startup::{
    parse_launchd_plist, startup_flags, LaunchdPlist, RunningProcess, StartupFlag, StartupItem,
    StartupItemDetail, StartupItems, StartupKind,
};
pub use status::{
    parse_alf_exceptions, parse_pf_rules, parse_sip, parse_spctl, FirewallDetail, FirewallStatus, GatekeeperStatus,
    PfAction, PfRule, SipStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    StartupItems,
    Gatekeeper,
    Firewall,
    SystemIntegrityProtection,
    KernelExtensions,
    Policies,
    Applications,
    Configurations,
    FileDescriptors,
}

impl ProbeKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::StartupItems => "startup_items",
            Self::Gatekeeper => "gatekeeper",
            Self::Firewall => "firewall",
            Self::SystemIntegrityProtection => "system_integrity_protection",
            Self::KernelExtensions => "kernel_extensions",
            Self::Policies => "policies",
            Self::Applications => "applications",
            Self::Configurations => "configurations",
            Self::FileDescriptors => "file_descriptors",
        }
    }
}

/// Either a probe's data or the error that replaced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProbeOutcome<T> {
    Failed { error: String },
    Data(T),
}

impl<T> ProbeOutcome<T> {
    pub fn from_result(res: Result<T>) -> Self {
        match res {
            Ok(v) => Self::Data(v),
            Err(e) => Self::Failed {
                error: e.to_string(),
            },
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Data(v) => Some(v),
            Self::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error } => Some(error),
            Self::Data(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum SecurityFinding {
    StartupItems(ProbeOutcome<StartupItems>),
    Gatekeeper(ProbeOutcome<GatekeeperStatus>),
    Firewall(ProbeOutcome<FirewallStatus>),
    SystemIntegrityProtection(ProbeOutcome<SipStatus>),
    KernelExtensions(ProbeOutcome<Vec<KernelExtension>>),
    Policies(ProbeOutcome<SecurityPolicies>),
    Applications(ProbeOutcome<Vec<Application>>),
    Configurations(ProbeOutcome<Vec<ConfigFile>>),
    FileDescriptors(ProbeOutcome<FileDescriptorInventory>),
}

impl SecurityFinding {
    pub fn kind(&self) -> ProbeKind {
        match self {
            Self::StartupItems(_) => ProbeKind::StartupItems,
            Self::Gatekeeper(_) => ProbeKind::Gatekeeper,
            Self::Firewall(_) => ProbeKind::Firewall,
            Self::SystemIntegrityProtection(_) => ProbeKind::SystemIntegrityProtection,
            Self::KernelExtensions(_) => ProbeKind::KernelExtensions,
            Self::Policies(_) => ProbeKind::Policies,
            Self::Applications(_) => ProbeKind::Applications,
            Self::Configurations(_) => ProbeKind::Configurations,
            Self::FileDescriptors(_) => ProbeKind::FileDescriptors,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::StartupItems(o) => o.error(),
            Self::Gatekeeper(o) => o.error(),
            Self::Firewall(o) => o.error(),
            Self::SystemIntegrityProtection(o) => o.error(),
            Self::KernelExtensions(o) => o.error(),
            Self::Policies(o) => o.error(),
            Self::Applications(o) => o.error(),
            Self::Configurations(o) => o.error(),
            Self::FileDescriptors(o) => o.error(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityReport {
    pub id: String,
    pub generated_at: DateTime<Utc>,
    pub detailed: bool,
    pub findings: Vec<SecurityFinding>,
}

macro_rules! finding_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> Option<&ProbeOutcome<$ty>> {
            self.findings.iter().find_map(|f| match f {
                SecurityFinding::$variant(o) => Some(o),
                _ => None,
            })
        }
    };
}

impl SecurityReport {
    fn new(detailed: bool, findings: Vec<SecurityFinding>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            generated_at: Utc::now(),
            detailed,
            findings,
        }
    }

    /// Kinds whose probe failed
    pub fn failed_probes(&self) -> Vec<ProbeKind> {
        self.findings
            .iter()
            .filter(|f| f.error().is_some())
            .map(SecurityFinding::kind)
            .collect()
    }

    finding_accessor!(startup_items, StartupItems, StartupItems);
    finding_accessor!(gatekeeper, Gatekeeper, GatekeeperStatus);
    finding_accessor!(firewall, Firewall, FirewallStatus);
    finding_accessor!(sip, SystemIntegrityProtection, SipStatus);
    finding_accessor!(kernel_extensions, KernelExtensions, Vec<KernelExtension>);
    finding_accessor!(policies, Policies, SecurityPolicies);
    finding_accessor!(applications, Applications, Vec<Application>);
    finding_accessor!(configurations, Configurations, Vec<ConfigFile>);
    finding_accessor!(file_descriptors, FileDescriptors, FileDescriptorInventory);
}

/// Await one probe and turn its failure into data.
async fn settle<T>(kind: ProbeKind, probe: impl Future<Output = Result<T>>) -> ProbeOutcome<T> {
    match probe.await {
        Ok(v) => ProbeOutcome::Data(v),
        Err(e) => {
            warn!(probe = kind.name(), error = %e, "security probe failed");
            ProbeOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}

pub struct SecurityAuditEngine {
    runner: Arc<dyn CommandRunner>,
    privilege: Arc<PrivilegeManager>,
    config: SecurityConfig,
    timeout: Duration,
}

impl SecurityAuditEngine {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        privilege: Arc<PrivilegeManager>,
        config: SecurityConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            privilege,
            config,
            timeout,
        }
    }

    /// Run unprivileged and require a zero exit status
    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<String> {
        let out = self.runner.run(program, args, self.timeout).await?;
        Ok(out.into_success(program)?.stdout)
    }

    /// Per-item lookups in flight at once, so large inventories stay within fd limits
    fn enrichment_limit(&self) -> usize {
        self.config.enrichment_concurrency.max(1)
    }

    pub async fn run_basic_scan(&self) -> SecurityReport {
        info!("performing basic security scan");
        let (startup, gatekeeper, firewall, sip, kexts) = tokio::join!(
            settle(ProbeKind::StartupItems, self.startup_items()),
            settle(ProbeKind::Gatekeeper, self.gatekeeper_status()),
            settle(ProbeKind::Firewall, self.firewall_status(false)),
            settle(ProbeKind::SystemIntegrityProtection, self.sip_status()),
            settle(ProbeKind::KernelExtensions, self.kernel_extensions()),
        );
        let report = SecurityReport::new(
            false,
            vec![
                SecurityFinding::StartupItems(startup),
                SecurityFinding::Gatekeeper(gatekeeper),
                SecurityFinding::Firewall(firewall),
                SecurityFinding::SystemIntegrityProtection(sip),
                SecurityFinding::KernelExtensions(kexts),
            ],
        );
        info!(id = %report.id, failed = report.failed_probes().len(), "basic security scan complete");
        report
    }

    pub async fn run_detailed_scan(&self) -> SecurityReport {
        info!("performing detailed security analysis");
        let (startup, gatekeeper, firewall, sip, kexts, policies, apps, configs, fds) = tokio::join!(
            settle(ProbeKind::StartupItems, self.startup_items_detailed()),
            settle(ProbeKind::Gatekeeper, self.gatekeeper_status()),
            settle(ProbeKind::Firewall, self.firewall_status(true)),
            settle(ProbeKind::SystemIntegrityProtection, self.sip_status()),
            settle(ProbeKind::KernelExtensions, self.kernel_extensions_detailed()),
            settle(ProbeKind::Policies, self.security_policies()),
            settle(ProbeKind::Applications, self.installed_applications()),
            settle(ProbeKind::Configurations, self.security_configurations()),
            settle(ProbeKind::FileDescriptors, self.file_descriptor_inventory()),
        );
        let report = SecurityReport::new(
            true,
            vec![
                SecurityFinding::StartupItems(startup),
                SecurityFinding::Gatekeeper(gatekeeper),
                SecurityFinding::Firewall(firewall),
                SecurityFinding::SystemIntegrityProtection(sip),
                SecurityFinding::KernelExtensions(kexts),
                SecurityFinding::Policies(policies),
                SecurityFinding::Applications(apps),
                SecurityFinding::Configurations(configs),
                SecurityFinding::FileDescriptors(fds),
            ],
        );
        info!(id = %report.id, failed = report.failed_probes().len(), "detailed security scan complete");
        report
    }
}
