//! Process and network collection with a tiered fallback chain:
//! privileged tool → unprivileged tool → cached snapshot.

mod detail;
mod host;
mod network;
mod process;
mod usage;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::CollectionConfig;
use crate::error::Result;
use crate::exec::CommandRunner;
use crate::privilege::PrivilegeManager;

pub use detail::{parse_open_file_line, parse_open_files, OpenFileEntry};
pub use host::{
    host_info, parse_arp, parse_arp_line, parse_ifconfig, parse_routes, parse_scutil_dns, ArpEntry,
    DnsResolver, HostInfo, InterfaceInfo, RouteEntry,
};
pub use network::{
    parse_lsof_socket_line, parse_lsof_sockets, parse_netstat, parse_netstat_line,
    parse_socket_name, ConnectionState, NetworkConnection, SocketName,
};
pub use process::{
    apply_command_lines, parse_command_lines, parse_ps_line, parse_ps_output, ProcessRecord,
};
pub use usage::{parse_nettop, NetworkUsageSample, UsageCache};

pub struct CollectionEngine {
    runner: Arc<dyn CommandRunner>,
    privilege: Arc<PrivilegeManager>,
    config: CollectionConfig,
    timeout: Duration,
    usage: UsageCache,
    /// Degraded bandwidth monitoring is reported once per engine
    usage_degraded_logged: AtomicBool,
}

impl CollectionEngine {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        privilege: Arc<PrivilegeManager>,
        config: CollectionConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            privilege,
            config,
            timeout,
            usage: UsageCache::default(),
            usage_degraded_logged: AtomicBool::new(false),
        }
    }

    /// Run unprivileged and require a zero exit status
    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<String> {
        let out = self.runner.run(program, args, self.timeout).await?;
        Ok(out.into_success(program)?.stdout)
    }

    /// Snapshot of every process; malformed rows are dropped.
    ///
    /// Without the command-line listing, `full_command_line` repeats `command`.
    pub async fn list_processes(&self) -> Result<Vec<ProcessRecord>> {
        let (stats, command_lines) = tokio::join!(
            self.run_checked(process::PS_PROGRAM, process::PS_ARGS),
            self.run_checked(process::PS_PROGRAM, process::PS_COMMAND_LINE_ARGS),
        );
        let mut records = parse_ps_output(&stats?);
        match command_lines {
            Ok(out) => apply_command_lines(&mut records, &parse_command_lines(&out)),
            Err(e) => debug!(error = %e, "command line listing failed"),
        }
        Ok(records)
    }

    /// Socket table, process-attributed when elevation is available.
    ///
    /// Only a failure of the unprivileged `netstat` tier reaches the caller.
    pub async fn list_network_connections(&self) -> Result<Vec<NetworkConnection>> {
        if self.config.request_elevation && !self.privilege.is_granted() {
            self.privilege.request_elevation().await;
        }

        if self.privilege.is_granted() {
            match self
                .privilege
                .run_privileged(detail::LSOF_PROGRAM, network::LSOF_SOCKETS_ARGS)
                .await
            {
                Ok(out) => {
                    let conns = parse_lsof_sockets(&out.stdout);
                    debug!(count = conns.len(), "collected process-attributed sockets");
                    return Ok(conns);
                }
                Err(e) => debug!(error = %e, "privileged socket listing failed, using netstat"),
            }
        }

        let stdout = self.run_checked("netstat", network::NETSTAT_ARGS).await?;
        Ok(parse_netstat(&stdout))
    }

    /// Per-process bandwidth, served from a short-lived cache.
    ///
    /// Without elevation (or when the probe fails) the last cached value is
    /// returned, possibly empty.
    pub async fn get_process_network_usage(&self) -> Vec<NetworkUsageSample> {
        if let Some(cached) = self.usage.fresh(self.config.usage_cache_ttl()) {
            return cached;
        }

        if !self.privilege.is_granted() {
            self.log_usage_degraded("network usage monitoring requires admin privileges");
            return self.usage.last();
        }

        match self
            .privilege
            .run_privileged(usage::NETTOP_PROGRAM, usage::NETTOP_ARGS)
            .await
        {
            Ok(out) => {
                let samples = parse_nettop(&out.stdout);
                self.usage.store(samples.clone());
                samples
            }
            Err(e) => {
                debug!(error = %e, "bandwidth probe failed");
                self.log_usage_degraded("network usage monitoring unavailable");
                self.usage.last()
            }
        }
    }

    fn log_usage_degraded(&self, message: &'static str) {
        if !self.usage_degraded_logged.swap(true, Ordering::Relaxed) {
            info!("{message}");
        }
    }

    async fn lsof_rows(&self, args: Vec<String>) -> Vec<OpenFileEntry> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match self.run_checked(detail::LSOF_PROGRAM, &args).await {
            Ok(stdout) => parse_open_files(&stdout),
            Err(e) => {
                debug!(error = %e, "per-process lsof failed");
                Vec::new()
            }
        }
    }

    /// Sockets of one process; empty on any failure.
    pub async fn get_connections_for_pid(&self, pid: u32) -> Vec<OpenFileEntry> {
        self.lsof_rows(detail::connection_args(pid)).await
    }

    /// Open files of one process; empty on any failure.
    pub async fn get_file_descriptors_for_pid(&self, pid: u32) -> Vec<OpenFileEntry> {
        self.lsof_rows(detail::descriptor_args(pid)).await
    }

    pub fn host_info(&self) -> HostInfo {
        host_info()
    }

    pub async fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        Ok(parse_ifconfig(&self.run_checked("ifconfig", &["-a"]).await?))
    }

    pub async fn routing_table(&self) -> Result<Vec<RouteEntry>> {
        Ok(parse_routes(&self.run_checked("netstat", &["-rn"]).await?))
    }

    pub async fn arp_table(&self) -> Result<Vec<ArpEntry>> {
        Ok(parse_arp(&self.run_checked("arp", &["-a"]).await?))
    }

    pub async fn dns_configuration(&self) -> Result<Vec<DnsResolver>> {
        Ok(parse_scutil_dns(&self.run_checked("scutil", &["--dns"]).await?))
    }
}
