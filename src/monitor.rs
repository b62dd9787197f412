//! Composition root: one runner, one privilege manager and both engines,
//! behind the request/response surface used by presentation layers.

use std::sync::Arc;

use tracing::info;

use crate::collectors::{
    ArpEntry, CollectionEngine, DnsResolver, HostInfo, InterfaceInfo, NetworkConnection,
    NetworkUsageSample, OpenFileEntry, ProcessRecord, RouteEntry,
};
use crate::config::MonitorConfig;
use crate::error::Result;
use crate::exec::{CommandRunner, SystemRunner};
use crate::privilege::{
    Elevator, PrivilegeManager, PrivilegeState, RenewalHandle, SessionStore, SudoElevator,
};
use crate::security::{SecurityAuditEngine, SecurityReport};

pub struct Monitor {
    privilege: Arc<PrivilegeManager>,
    collection: CollectionEngine,
    security: SecurityAuditEngine,
    renewal: RenewalHandle,
    elevation_window_minutes: u32,
}

impl Monitor {
    /// Wire the real subprocess runner and `sudo` elevation.
    pub async fn start(config: &MonitorConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let elevator: Arc<dyn Elevator> = Arc::new(SudoElevator::new(
            runner.clone(),
            config.privilege.sudo_program.clone(),
            config.probes.timeout(),
            config.privilege.prompt_timeout(),
        ));
        Self::with_parts(config, runner, elevator).await
    }

    /// Wire the given runner and elevator; the renewal heartbeat starts immediately.
    pub async fn with_parts(
        config: &MonitorConfig,
        runner: Arc<dyn CommandRunner>,
        elevator: Arc<dyn Elevator>,
    ) -> Self {
        let timeout = config.probes.timeout();
        let store = SessionStore::new(config.privilege.session_file());
        let privilege = Arc::new(
            PrivilegeManager::initialize(
                store,
                elevator,
                runner.clone(),
                config.privilege.clone(),
                timeout,
            )
            .await,
        );
        let renewal = privilege.spawn_renewal();
        let collection = CollectionEngine::new(
            runner.clone(),
            privilege.clone(),
            config.collection.clone(),
            timeout,
        );
        let security =
            SecurityAuditEngine::new(runner, privilege.clone(), config.security.clone(), timeout);
        info!(state = ?privilege.state(), "monitor started");
        Self {
            privilege,
            collection,
            security,
            renewal,
            elevation_window_minutes: config.privilege.elevation_window_minutes,
        }
    }

    pub fn privilege_state(&self) -> PrivilegeState {
        self.privilege.state()
    }

    pub async fn request_elevation(&self) -> PrivilegeState {
        self.privilege.request_elevation().await
    }

    /// Raise the sudo credential cache lifetime to the configured window.
    pub async fn extend_elevation_window(&self) -> Result<()> {
        self.privilege
            .extend_elevation_window(self.elevation_window_minutes)
            .await
    }

    pub async fn list_processes(&self) -> Result<Vec<ProcessRecord>> {
        self.collection.list_processes().await
    }

    pub async fn list_network_connections(&self) -> Result<Vec<NetworkConnection>> {
        self.collection.list_network_connections().await
    }

    pub async fn get_process_network_usage(&self) -> Vec<NetworkUsageSample> {
        self.collection.get_process_network_usage().await
    }

    pub async fn get_connections_for_pid(&self, pid: u32) -> Vec<OpenFileEntry> {
        self.collection.get_connections_for_pid(pid).await
    }

    pub async fn get_file_descriptors_for_pid(&self, pid: u32) -> Vec<OpenFileEntry> {
        self.collection.get_file_descriptors_for_pid(pid).await
    }

    pub async fn run_basic_scan(&self) -> SecurityReport {
        self.security.run_basic_scan().await
    }

    pub async fn run_detailed_scan(&self) -> SecurityReport {
        self.security.run_detailed_scan().await
    }

    pub fn host_info(&self) -> HostInfo {
        self.collection.host_info()
    }

    pub async fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        self.collection.interfaces().await
    }

    pub async fn routing_table(&self) -> Result<Vec<RouteEntry>> {
        self.collection.routing_table().await
    }

    pub async fn arp_table(&self) -> Result<Vec<ArpEntry>> {
        self.collection.arp_table().await
    }

    pub async fn dns_configuration(&self) -> Result<Vec<DnsResolver>> {
        self.collection.dns_configuration().await
    }

    /// Stop the renewal heartbeat and wait for it to exit.
    pub async fn shutdown(self) {
        self.renewal.shutdown().await;
        info!("monitor stopped");
    }
}
