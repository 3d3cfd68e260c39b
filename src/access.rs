//! Remote engine access facade
//!
//! Owns the connection pool and the tunnel manager, and is the only thing
//! outer layers (API handlers, collectors, bots) are expected to hold.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{ConfigStorage, EngineAccessConfig, StorageError};
use crate::credentials::CredentialResolver;
use crate::pool::{ConnectionPool, PerformanceReport, PoolError, PoolStatus};
use crate::ssh::{RusshConnector, SessionConnector};
use crate::tunnel::{EngineClient, TunnelError, TunnelInfo, TunnelManager};

/// Fleet-wide engine clients, split by reachability
#[derive(Debug, Default)]
pub struct FleetClients {
    pub clients: Vec<(String, EngineClient)>,
    /// Host id and the reason it was skipped
    pub unreachable: Vec<(String, String)>,
}

/// Combined snapshot for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct AccessStatus {
    pub pool: PoolStatus,
    pub tunnels: Vec<TunnelInfo>,
}

pub struct RemoteEngineAccess {
    config: EngineAccessConfig,
    pool: Arc<ConnectionPool>,
    tunnels: Arc<TunnelManager>,
}

impl RemoteEngineAccess {
    pub fn new(
        config: EngineAccessConfig,
        resolver: Arc<dyn CredentialResolver>,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        let pool = ConnectionPool::new(&config, resolver, connector);
        let tunnels = TunnelManager::new(pool.clone(), config.tunnel.clone());
        Self {
            config,
            pool,
            tunnels,
        }
    }

    /// Production wiring over russh
    pub fn with_russh(config: EngineAccessConfig, resolver: Arc<dyn CredentialResolver>) -> Self {
        Self::new(config, resolver, Arc::new(RusshConnector))
    }

    /// Load the config file (defaults when missing) and wire over russh
    pub async fn from_storage(
        storage: &ConfigStorage,
        resolver: Arc<dyn CredentialResolver>,
    ) -> Result<Self, StorageError> {
        let config = storage.load().await?;
        Ok(Self::with_russh(config, resolver))
    }

    pub fn config(&self) -> &EngineAccessConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    /// Start keepalive, reaper, recovery and tunnel health loops
    pub fn start(&self) {
        self.pool.start();
        self.tunnels.start();
        info!("Remote engine access started");
    }

    pub async fn shutdown(&self) {
        info!("Shutting down remote engine access");
        self.tunnels.shutdown().await;
        self.pool.shutdown().await;
    }

    pub async fn get_engine_client(&self, host_id: &str) -> Result<EngineClient, TunnelError> {
        self.tunnels.get_engine_client(host_id).await
    }

    /// Run a shell command on the host through its command queue
    pub async fn execute_remote_command(
        &self,
        host_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, PoolError> {
        self.pool.enqueue_command(host_id, command, timeout).await
    }

    /// Same, with the pool's default command timeout
    pub async fn execute_remote_command_default(
        &self,
        host_id: &str,
        command: &str,
    ) -> Result<String, PoolError> {
        let timeout = self.config.pool.default_command_timeout();
        self.execute_remote_command(host_id, command, timeout).await
    }

    /// Cheap probe; connects if needed
    pub async fn check_host_reachable(&self, host_id: &str) -> bool {
        let probe = &self.config.pool.probe_command;
        match self
            .pool
            .enqueue_command(host_id, probe, self.config.pool.probe_timeout())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Host {} unreachable: {}", host_id, e);
                false
            }
        }
    }

    /// Drop the host's tunnel, then its session
    pub async fn close_host(&self, host_id: &str) {
        self.tunnels.close(host_id).await;
        self.pool.close_connection(host_id).await;
    }

    pub async fn close_all(&self) {
        self.tunnels.close_all().await;
        self.pool.close_all().await;
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn performance_report(&self) -> PerformanceReport {
        self.pool.performance_report()
    }

    pub fn tunnel_info(&self) -> Vec<TunnelInfo> {
        self.tunnels.tunnel_info()
    }

    pub fn status(&self) -> AccessStatus {
        AccessStatus {
            pool: self.pool_status(),
            tunnels: self.tunnel_info(),
        }
    }

    /// Engine clients for many hosts at once; failing hosts are skipped, not fatal
    pub async fn engine_clients<S: AsRef<str>>(&self, hosts: &[S]) -> FleetClients {
        let results = join_all(hosts.iter().map(|host| async move {
            let host = host.as_ref();
            (host.to_string(), self.get_engine_client(host).await)
        }))
        .await;

        let mut fleet = FleetClients::default();
        for (host, result) in results {
            match result {
                Ok(client) => fleet.clients.push((host, client)),
                Err(e) => {
                    warn!("Skipping {}: {}", host, e);
                    fleet.unreachable.push((host, e.to_string()));
                }
            }
        }
        fleet
    }
}
