//! Engine Tunnel Manager
//!
//! One tunnel per remote host:
//!
//! ```text
//! bollard ──tcp──> 127.0.0.1:<local_port> ══ssh direct-tcpip══> 127.0.0.1:<relay_port> ─socat─> engine.sock
//! ```
//!
//! A tunnel is only valid while its forward runs and the pool still holds
//! the session record it was built on. Anything else gets rebuilt.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::EngineClient;
use super::relay::RelayBootstrap;
use super::TunnelError;
use crate::config::TunnelConfig;
use crate::forwarding::{
    start_local_forward_with_activity, ActivityHook, ForwardStats, LocalForward,
    LocalForwardHandle,
};
use crate::pool::{ConnectionPool, PoolError};

/// Tunnel lifecycle per host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Unbound,
    Probing,
    Bootstrapping,
    Tunneled,
    Failed,
    Closed,
}

/// An active bridge to one host's engine
pub struct TunnelRecord {
    pub host_id: String,
    pub forward: LocalForwardHandle,
    pub local_port: u16,
    pub relay_port: u16,
    /// Session record the forward runs on
    pub session_record_id: String,
    pub relay_pid: Option<u32>,
    pub client: EngineClient,
    pub created_at: DateTime<Utc>,
}

/// Serializable tunnel snapshot
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub host_id: String,
    pub state: TunnelState,
    pub local_port: Option<u16>,
    pub relay_port: Option<u16>,
    pub relay_pid: Option<u32>,
    pub session_record_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub stats: Option<ForwardStats>,
    pub last_error: Option<String>,
}

/// `localhost`, `127.0.0.0/8` and `::1`
pub fn is_loopback_address(address: &str) -> bool {
    let address = address.trim().trim_start_matches('[').trim_end_matches(']');
    if address.eq_ignore_ascii_case("localhost") {
        return true;
    }
    address
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

pub struct TunnelManager {
    me: Weak<TunnelManager>,
    pool: Arc<ConnectionPool>,
    config: TunnelConfig,

    tunnels: DashMap<String, Arc<TunnelRecord>>,
    /// Loopback hosts talk to the local socket directly
    local_clients: DashMap<String, EngineClient>,
    states: DashMap<String, TunnelState>,
    last_errors: DashMap<String, String>,
    /// 记住上次的 relay 端口，重建隧道时优先复用仍在运行的 relay
    relay_ports: DashMap<String, u16>,
    build_locks: DashMap<String, Arc<Mutex<()>>>,

    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelManager {
    pub fn new(pool: Arc<ConnectionPool>, config: TunnelConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            pool,
            config,
            tunnels: DashMap::new(),
            local_clients: DashMap::new(),
            states: DashMap::new(),
            last_errors: DashMap::new(),
            relay_ports: DashMap::new(),
            build_locks: DashMap::new(),
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Start the periodic health check
    pub fn start(&self) {
        let me = self.me.clone();
        let shutdown = self.shutdown.clone();
        let period = self.config.health_check_interval();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(manager) = me.upgrade() else { break };
                let results = manager.health_check_all().await;
                let unhealthy = results.values().filter(|ok| !**ok).count();
                if unhealthy > 0 {
                    warn!("Tunnel health check: {} of {} unhealthy", unhealthy, results.len());
                }
            }
            debug!("Tunnel health task stopped");
        });

        self.tasks.lock().push(task);
        info!("Tunnel manager started (health check every {:?})", period);
    }

    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.close_all().await;
    }

    pub fn state(&self, host: &str) -> TunnelState {
        self.states
            .get(host)
            .map(|s| *s.value())
            .unwrap_or(TunnelState::Unbound)
    }

    fn set_state(&self, host: &str, state: TunnelState) {
        debug!("[{}] tunnel state -> {:?}", host, state);
        self.states.insert(host.to_string(), state);
    }

    fn is_valid(&self, host: &str, tunnel: &TunnelRecord) -> bool {
        if !tunnel.forward.is_running() {
            return false;
        }
        self.pool
            .session_record(host)
            .map(|r| r.record_id == tunnel.session_record_id && r.is_alive())
            .unwrap_or(false)
    }

    fn current_client(&self, host: &str) -> Option<EngineClient> {
        let tunnel = self.tunnels.get(host)?.value().clone();
        if !self.is_valid(host, &tunnel) {
            return None;
        }
        // Tunnel use is session use
        self.touch_session(host);
        Some(tunnel.client.clone())
    }

    fn touch_session(&self, host: &str) {
        if let Some(record) = self.pool.session_record(host) {
            record.touch();
        }
    }

    /// Engine client for `host`, building the tunnel when needed
    pub async fn get_engine_client(&self, host: &str) -> Result<EngineClient, TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::ShutDown.into());
        }
        if let Some(client) = self.current_client(host) {
            return Ok(client);
        }
        if let Some(client) = self.local_clients.get(host) {
            return Ok(client.value().clone());
        }

        let credentials = self.pool.credentials(host).await?;
        if is_loopback_address(&credentials.address) {
            let client = EngineClient::local_socket(
                &self.config.local_socket_path,
                self.config.engine_timeout_secs,
            )?;
            info!(
                "[{}] Loopback host, using local socket {}",
                host, self.config.local_socket_path
            );
            self.local_clients.insert(host.to_string(), client.clone());
            self.set_state(host, TunnelState::Tunneled);
            return Ok(client);
        }

        let lock = self
            .build_locks
            .entry(host.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        // 获取锁后再次检查，可能已被并发调用者建好
        if let Some(client) = self.current_client(host) {
            return Ok(client);
        }
        if let Some(stale) = self.tunnels.get(host).map(|t| t.value().clone()) {
            info!("[{}] Tunnel no longer valid, rebuilding", host);
            self.remove_tunnel(host, &stale).await;
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.build(host).await {
                Ok(tunnel) => {
                    let client = tunnel.client.clone();
                    info!(
                        "[{}] Engine tunnel ready: 127.0.0.1:{} -> relay {}",
                        host, tunnel.local_port, tunnel.relay_port
                    );
                    self.tunnels.insert(host.to_string(), tunnel);
                    self.last_errors.remove(host);
                    self.set_state(host, TunnelState::Tunneled);
                    return Ok(client);
                }
                Err(TunnelError::Pool(e)) if !retryable(&e) => {
                    self.fail(host, &e.to_string());
                    return Err(e.into());
                }
                Err(e) => {
                    warn!("[{}] Tunnel attempt {}/{} failed: {}", host, attempt, max_attempts, e);
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_delay(attempt)).await;
                    }
                }
            }
        }

        self.fail(host, &last_error);
        Err(TunnelError::Unavailable {
            host: host.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }

    fn fail(&self, host: &str, error: &str) {
        self.last_errors.insert(host.to_string(), error.to_string());
        self.set_state(host, TunnelState::Failed);
    }

    async fn build(&self, host: &str) -> Result<Arc<TunnelRecord>, TunnelError> {
        self.pool.get_connection(host).await?;

        self.set_state(host, TunnelState::Probing);
        let bootstrap = RelayBootstrap::new(self.pool.as_ref(), host, &self.config);
        bootstrap.probe_engine().await?;

        self.set_state(host, TunnelState::Bootstrapping);
        let preferred = self.relay_ports.get(host).map(|p| *p.value());
        let relay = bootstrap.ensure_relay(preferred).await?;
        self.relay_ports.insert(host.to_string(), relay.port);

        // Bootstrap commands may have reconnected; bind to whatever is current now
        let record = self.pool.get_connection(host).await?;
        let activity: ActivityHook = {
            let record = Arc::downgrade(&record);
            Arc::new(move || {
                if let Some(record) = record.upgrade() {
                    record.touch();
                }
            })
        };
        let forward = start_local_forward_with_activity(
            record.session(),
            LocalForward::ephemeral_loopback(relay.port),
            Some(activity),
        )
        .await
        .map_err(|e| TunnelError::Bind(e.to_string()))?;

        let local_port = forward.local_port();
        let client = match EngineClient::tunneled(local_port, self.config.engine_timeout_secs) {
            Ok(client) => client,
            Err(e) => {
                forward.stop().await;
                return Err(e);
            }
        };

        Ok(Arc::new(TunnelRecord {
            host_id: host.to_string(),
            forward,
            local_port,
            relay_port: relay.port,
            session_record_id: record.record_id.clone(),
            relay_pid: relay.pid,
            client,
            created_at: Utc::now(),
        }))
    }

    /// Remove one specific tunnel record and stop its forward
    async fn remove_tunnel(&self, host: &str, tunnel: &Arc<TunnelRecord>) -> bool {
        match self.tunnels.remove_if(host, |_, t| Arc::ptr_eq(t, tunnel)) {
            Some((_, removed)) => {
                removed.forward.stop().await;
                true
            }
            None => false,
        }
    }

    /// Ping the host's engine; an unhealthy tunnel is torn down for rebuild
    pub async fn health_check(&self, host: &str) -> bool {
        if let Some(client) = self.local_clients.get(host).map(|c| c.value().clone()) {
            return match client.ping().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("[{}] Local engine ping failed: {}", host, e);
                    self.local_clients.remove(host);
                    self.set_state(host, TunnelState::Unbound);
                    false
                }
            };
        }

        let Some(tunnel) = self.tunnels.get(host).map(|t| t.value().clone()) else {
            return false;
        };

        let healthy = if self.is_valid(host, &tunnel) {
            // Long-lived streams (logs, events) keep the session busy
            if tunnel.forward.stats().active_connections > 0 {
                self.touch_session(host);
            }
            match tunnel.client.ping().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("[{}] Engine ping through tunnel failed: {}", host, e);
                    false
                }
            }
        } else {
            debug!("[{}] Tunnel lost its session", host);
            false
        };

        if !healthy && self.remove_tunnel(host, &tunnel).await {
            self.set_state(host, TunnelState::Unbound);
        }
        healthy
    }

    /// Health check every bound host concurrently
    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        let mut hosts: Vec<String> = self.tunnels.iter().map(|t| t.key().clone()).collect();
        hosts.extend(self.local_clients.iter().map(|c| c.key().clone()));
        hosts.sort();
        hosts.dedup();

        let results = join_all(hosts.iter().map(|host| self.health_check(host))).await;
        hosts.into_iter().zip(results).collect()
    }

    /// Stop the host's listener and forwarded sockets
    pub async fn close(&self, host: &str) {
        self.local_clients.remove(host);
        if let Some((_, tunnel)) = self.tunnels.remove(host) {
            info!("[{}] Closing engine tunnel on port {}", host, tunnel.local_port);
            tunnel.forward.stop().await;
        }
        if self.states.contains_key(host) {
            self.set_state(host, TunnelState::Closed);
        }
    }

    pub async fn close_all(&self) {
        let mut hosts: Vec<String> = self.tunnels.iter().map(|t| t.key().clone()).collect();
        hosts.extend(self.local_clients.iter().map(|c| c.key().clone()));
        hosts.sort();
        hosts.dedup();
        join_all(hosts.iter().map(|host| self.close(host))).await;
    }

    pub fn tunnel_info(&self) -> Vec<TunnelInfo> {
        let mut infos: Vec<TunnelInfo> = self
            .states
            .iter()
            .map(|entry| {
                let host = entry.key();
                let tunnel = self.tunnels.get(host).map(|t| t.value().clone());
                TunnelInfo {
                    host_id: host.clone(),
                    state: *entry.value(),
                    local_port: tunnel.as_ref().map(|t| t.local_port),
                    relay_port: tunnel
                        .as_ref()
                        .map(|t| t.relay_port)
                        .or_else(|| self.relay_ports.get(host).map(|p| *p.value())),
                    relay_pid: tunnel.as_ref().and_then(|t| t.relay_pid),
                    session_record_id: tunnel.as_ref().map(|t| t.session_record_id.clone()),
                    created_at: tunnel.as_ref().map(|t| t.created_at),
                    stats: tunnel.as_ref().map(|t| t.forward.stats()),
                    last_error: self.last_errors.get(host).map(|e| e.value().clone()),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        infos
    }
}

/// Retrying cannot help with these
fn retryable(err: &PoolError) -> bool {
    !matches!(
        err,
        PoolError::Credential { .. }
            | PoolError::Connection { .. }
            | PoolError::RateLimited { .. }
            | PoolError::ShutDown
    )
}
