//! SSH Connection Pool
//!
//! 每个主机最多一个活跃的 SSH 会话，所有命令经由每主机队列串行执行。
//!
//! # Lifecycle
//!
//! - `get_connection` reuses a healthy record (transport open, idle below
//!   `connection_timeout`) or creates one under a per-host connect lock
//! - a watcher task removes the record as soon as the transport reports closure
//! - keepalive probes (through the queue) retire sessions that stopped answering
//! - the idle reaper retires sessions unused for longer than `connection_timeout`
//! - `close_connection` ends the transport, faults queued commands and clears
//!   the attempt counter

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::attempts::{connect_backoff_delay, AttemptCounter};
use super::output::sanitize_output;
use super::quality::{quality_tier, QualityTier};
use super::queue::{CommandExecutor, CommandKind, CommandQueue, CommandRequest};
use super::recovery::{FailureInfo, FailureTracker, RecoveryMonitor};
use super::PoolError;
use crate::config::{EngineAccessConfig, PoolConfig};
use crate::credentials::{CredentialResolver, HostCredentials};
use crate::ssh::{wait_closed, RemoteSession, SessionConnector, SshError};

/// One live session for one host
pub struct SessionRecord {
    /// Unique per connection; a reconnect yields a new id
    pub record_id: String,
    pub host_id: String,
    pub display_name: String,
    pub address: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,

    /// 最后使用时间（单调时钟，用于空闲判断）
    last_used: parking_lot::Mutex<Instant>,
    /// 最后使用时间（Unix 时间戳，毫秒，用于报告）
    last_used_at: AtomicI64,

    session: Arc<dyn RemoteSession>,
    alive: AtomicBool,

    command_count: AtomicU64,
    failed_commands: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("record_id", &self.record_id)
            .field("host_id", &self.host_id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("session_id", &self.session.id())
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl SessionRecord {
    pub fn new(credentials: &HostCredentials, session: Arc<dyn RemoteSession>) -> Self {
        let now = Utc::now();
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            host_id: credentials.host_id.clone(),
            display_name: credentials.label().to_string(),
            address: credentials.address.clone(),
            port: credentials.port,
            created_at: now,
            last_used: parking_lot::Mutex::new(Instant::now()),
            last_used_at: AtomicI64::new(now.timestamp_millis()),
            session,
            alive: AtomicBool::new(true),
            command_count: AtomicU64::new(0),
            failed_commands: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> Arc<dyn RemoteSession> {
        self.session.clone()
    }

    /// 更新活动时间
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
        self.last_used_at
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    pub fn last_used_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.last_used_at.load(Ordering::SeqCst))
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.session.is_closed()
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn record_command(&self, latency: Duration, success: bool) {
        self.command_count.fetch_add(1, Ordering::SeqCst);
        self.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::SeqCst);
        if !success {
            self.failed_commands.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn command_count(&self) -> u64 {
        self.command_count.load(Ordering::SeqCst)
    }

    pub fn failed_commands(&self) -> u64 {
        self.failed_commands.load(Ordering::SeqCst)
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        match self.command_count() {
            0 => None,
            n => Some(self.total_latency_ms.load(Ordering::SeqCst) as f64 / n as f64),
        }
    }

    pub fn success_rate(&self) -> f64 {
        match self.command_count() {
            0 => 1.0,
            n => (n - self.failed_commands().min(n)) as f64 / n as f64,
        }
    }

    pub fn quality(&self) -> QualityTier {
        quality_tier(self.avg_latency_ms(), self.success_rate())
    }

    fn to_info(&self, queue_depth: usize, busy: bool) -> SessionInfo {
        SessionInfo {
            host_id: self.host_id.clone(),
            display_name: self.display_name.clone(),
            address: self.address.clone(),
            port: self.port,
            record_id: self.record_id.clone(),
            session_id: self.session.id().to_string(),
            created_at: self.created_at,
            last_used_at: self.last_used_at(),
            idle_secs: self.idle_for().as_secs(),
            alive: self.is_alive(),
            command_count: self.command_count(),
            failed_commands: self.failed_commands(),
            avg_latency_ms: self.avg_latency_ms(),
            success_rate: self.success_rate(),
            quality: self.quality(),
            queue_depth,
            busy,
        }
    }
}

/// Serializable view of a session record
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub host_id: String,
    pub display_name: String,
    pub address: String,
    pub port: u16,
    pub record_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub idle_secs: u64,
    pub alive: bool,
    pub command_count: u64,
    pub failed_commands: u64,
    pub avg_latency_ms: Option<f64>,
    pub success_rate: f64,
    pub quality: QualityTier,
    pub queue_depth: usize,
    pub busy: bool,
}

/// Pool snapshot for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub generated_at: DateTime<Utc>,
    pub total_sessions: usize,
    pub alive_sessions: usize,
    pub total_queue_depth: usize,
    pub busy_hosts: Vec<String>,
    pub failing_hosts: usize,
    pub rate_limited_hosts: Vec<String>,
    pub sessions: Vec<SessionInfo>,
}

/// Per-host performance line
#[derive(Debug, Clone, Serialize)]
pub struct HostPerformance {
    pub host_id: String,
    pub display_name: String,
    pub command_count: u64,
    pub failed_commands: u64,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    pub quality: QualityTier,
    pub uptime_secs: i64,
}

/// Aggregated performance report
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub total_commands: u64,
    pub failed_commands: u64,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
    /// Session count per quality tier
    pub tiers: BTreeMap<String, usize>,
    pub hosts: Vec<HostPerformance>,
    pub failures: Vec<FailureInfo>,
}

/// Connection pool: one session per host
pub struct ConnectionPool {
    me: Weak<ConnectionPool>,
    config: PoolConfig,
    resolver: Arc<dyn CredentialResolver>,
    connector: Arc<dyn SessionConnector>,

    sessions: DashMap<String, Arc<SessionRecord>>,
    connect_locks: DashMap<String, Arc<Mutex<()>>>,
    attempts: DashMap<String, AttemptCounter>,
    failures: FailureTracker,
    queue: CommandQueue,
    recovery: RecoveryMonitor,

    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        config: &EngineAccessConfig,
        resolver: Arc<dyn CredentialResolver>,
        connector: Arc<dyn SessionConnector>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<ConnectionPool>| {
            let executor: Weak<dyn CommandExecutor> = me.clone();
            Self {
                me: me.clone(),
                config: config.pool.clone(),
                resolver,
                connector,
                sessions: DashMap::new(),
                connect_locks: DashMap::new(),
                attempts: DashMap::new(),
                failures: FailureTracker::new(&config.recovery),
                queue: CommandQueue::new(config.queue.clone(), executor),
                recovery: RecoveryMonitor::new(config.recovery.clone()),
                tasks: parking_lot::Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn failure_tracker(&self) -> &FailureTracker {
        &self.failures
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Start keepalive, idle reaper and recovery loops
    pub fn start(&self) {
        let keepalive = self.spawn_periodic(
            "keepalive",
            self.config.keepalive_interval(),
            |pool| async move { pool.run_keepalive_pass().await },
        );
        let reaper = self.spawn_periodic(
            "idle-reaper",
            self.config.reap_interval(),
            |pool| async move {
                pool.reap_idle().await;
            },
        );
        let recovery = self.spawn_periodic(
            "recovery",
            self.recovery.interval(),
            |pool| async move {
                pool.recovery.run_pass(&pool).await;
            },
        );

        self.tasks.lock().extend([keepalive, reaper, recovery]);
        info!("Connection pool background tasks started");
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<ConnectionPool>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let me = self.me.clone();
        tokio::spawn(async move {
            debug!("Pool task {} started (period={:?})", name, period);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 跳过立即触发的第一次 tick
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(pool) = me.upgrade() else { break };
                if pool.is_shut_down() {
                    break;
                }
                tick(pool).await;
            }
            debug!("Pool task {} stopped", name);
        })
    }

    /// Stop background tasks, fault queued commands and close every session
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down connection pool ({} sessions)", self.sessions.len());

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.queue.shutdown();

        let records: Vec<Arc<SessionRecord>> =
            self.sessions.iter().map(|r| r.value().clone()).collect();
        self.sessions.clear();
        join_all(records.iter().map(|record| async move {
            record.mark_dead();
            record.session.close().await;
        }))
        .await;
    }

    /// Existing record for a host, healthy or not
    pub fn session_record(&self, host: &str) -> Option<Arc<SessionRecord>> {
        self.sessions.get(host).map(|r| r.value().clone())
    }

    /// Resolve the host's credentials
    pub async fn credentials(&self, host: &str) -> Result<HostCredentials, PoolError> {
        self.resolver
            .resolve(host)
            .await
            .map_err(|e| PoolError::credential(host, e))
    }

    fn healthy_record(&self, host: &str) -> Option<Arc<SessionRecord>> {
        let record = self.sessions.get(host)?.value().clone();
        if record.is_alive() && record.idle_for() < self.config.connection_timeout() {
            Some(record)
        } else {
            None
        }
    }

    /// Return the host's live session record, connecting if needed
    pub async fn get_connection(&self, host: &str) -> Result<Arc<SessionRecord>, PoolError> {
        self.acquire(host, CommandKind::Foreground).await
    }

    async fn acquire(&self, host: &str, kind: CommandKind) -> Result<Arc<SessionRecord>, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }

        if let Some(record) = self.healthy_record(host) {
            if kind != CommandKind::Keepalive {
                record.touch();
            }
            return Ok(record);
        }

        // 保活探测只针对已有会话，不主动建连
        if kind == CommandKind::Keepalive {
            return Err(PoolError::ConnectionClosed(host.to_string()));
        }

        let lock = self
            .connect_locks
            .entry(host.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        // 获取锁后再次检查，可能已被其他调用者建立
        if let Some(record) = self.healthy_record(host) {
            debug!("Reusing session for {} created by a concurrent caller", host);
            record.touch();
            return Ok(record);
        }

        if let Some((_, stale)) = self.sessions.remove(host) {
            info!(
                "Replacing stale session {} for {} (idle {:?})",
                stale.record_id,
                host,
                stale.idle_for()
            );
            stale.mark_dead();
            stale.session.close().await;
        }

        self.connect(host, kind).await
    }

    async fn connect(&self, host: &str, kind: CommandKind) -> Result<Arc<SessionRecord>, PoolError> {
        // 凭据错误不重试，也不计入失败记录
        let credentials = self.credentials(host).await?;
        let ssh_config = credentials
            .to_ssh_config(
                self.config.handshake_timeout_secs,
                self.config.transport_keepalive_secs,
            )
            .map_err(|e| PoolError::credential(host, e))?;

        let handshake_timeout = Duration::from_secs(self.config.handshake_timeout_secs);
        let mut last_error: Option<String> = None;

        loop {
            let Some(attempt) = self.register_attempt(host) else {
                let last_error = last_error
                    .or_else(|| self.failures.get(host).map(|r| r.last_error))
                    .unwrap_or_else(|| "attempt limit reached".to_string());
                warn!(
                    "Connection attempts to {} exhausted ({} per {:?})",
                    host,
                    self.config.max_connection_attempts,
                    self.config.attempt_window()
                );
                return Err(PoolError::RateLimited {
                    host: host.to_string(),
                    attempts: self.config.max_connection_attempts,
                    last_error,
                });
            };

            let delay = connect_backoff_delay(
                attempt,
                Duration::from_millis(self.config.backoff_base_ms),
                Duration::from_millis(self.config.backoff_max_ms),
                self.jitter(),
            );
            if !delay.is_zero() {
                debug!("Waiting {:?} before connection attempt {} to {}", delay, attempt, host);
                tokio::time::sleep(delay).await;
            }

            info!(
                "Connecting to {} ({}@{}:{}), attempt {}",
                host, ssh_config.username, ssh_config.host, ssh_config.port, attempt
            );

            let result = tokio::time::timeout(handshake_timeout, self.connector.connect(&ssh_config))
                .await
                .unwrap_or_else(|_| {
                    Err(SshError::Timeout(format!(
                        "handshake did not complete within {:?}",
                        handshake_timeout
                    )))
                });

            match result {
                Ok(session) => {
                    self.attempts.remove(host);
                    let record = Arc::new(SessionRecord::new(&credentials, session));
                    self.sessions.insert(host.to_string(), record.clone());
                    self.watch_transport(&record);
                    info!(
                        "Session {} established for {} ({})",
                        record.record_id, host, record.address
                    );
                    return Ok(record);
                }
                Err(e @ (SshError::AuthenticationFailed(_) | SshError::HostKeyRejected(_))) => {
                    let reason = e.to_string();
                    warn!("{} rejected connection attempt {}: {}", host, attempt, reason);
                    if kind != CommandKind::Recovery {
                        self.failures.record_failure(host, &reason);
                    }
                    return Err(PoolError::Connection {
                        host: host.to_string(),
                        reason,
                    });
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!("Connection attempt {} to {} failed: {}", attempt, host, reason);
                    if kind != CommandKind::Recovery {
                        self.failures.record_failure(host, &reason);
                    }
                    last_error = Some(reason);
                }
            }
        }
    }

    fn register_attempt(&self, host: &str) -> Option<u32> {
        let now = Instant::now();
        let mut counter = self
            .attempts
            .entry(host.to_string())
            .or_insert_with(|| AttemptCounter::new(now));
        counter.try_register(
            now,
            self.config.attempt_window(),
            self.config.max_connection_attempts,
        )
    }

    fn jitter(&self) -> Duration {
        if self.config.backoff_jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..self.config.backoff_jitter_ms))
    }

    /// Drop attempt counters whose window elapsed
    pub fn purge_expired_attempts(&self) -> usize {
        let now = Instant::now();
        let window = self.config.attempt_window();
        let before = self.attempts.len();
        self.attempts.retain(|_, c| !c.is_expired(now, window));
        before - self.attempts.len()
    }

    fn watch_transport(&self, record: &Arc<SessionRecord>) {
        let mut closed_rx = record.session.subscribe_closed();
        let me = self.me.clone();
        let host = record.host_id.clone();
        let record_id = record.record_id.clone();

        tokio::spawn(async move {
            wait_closed(&mut closed_rx).await;
            if let Some(pool) = me.upgrade() {
                if pool.remove_record(&host, &record_id) {
                    info!("Transport for {} closed, session {} removed", host, record_id);
                }
            }
        });
    }

    fn remove_record(&self, host: &str, record_id: &str) -> bool {
        match self.sessions.remove_if(host, |_, r| r.record_id == record_id) {
            Some((_, record)) => {
                record.mark_dead();
                true
            }
            None => false,
        }
    }

    /// Remove and close one specific session, leaving the queue untouched
    async fn retire(&self, host: &str, record: &SessionRecord) {
        if self.remove_record(host, &record.record_id) {
            record.session.close().await;
        }
    }

    /// Run a command directly on the host's session (no queueing)
    pub async fn execute_command(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, PoolError> {
        self.run(&CommandRequest {
            host: host.to_string(),
            command: command.to_string(),
            timeout,
            kind: CommandKind::Foreground,
        })
        .await
    }

    /// Run a command through the host's queue
    pub async fn enqueue_command(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, PoolError> {
        self.queue
            .enqueue(CommandRequest {
                host: host.to_string(),
                command: command.to_string(),
                timeout,
                kind: CommandKind::Foreground,
            })
            .await
    }

    /// Cheap probe through the queue, used by the recovery monitor
    pub async fn recovery_probe(&self, host: &str) -> Result<String, PoolError> {
        self.queue
            .enqueue(CommandRequest {
                host: host.to_string(),
                command: self.config.probe_command.clone(),
                timeout: self.config.probe_timeout(),
                kind: CommandKind::Recovery,
            })
            .await
    }

    async fn run(&self, request: &CommandRequest) -> Result<String, PoolError> {
        let host = request.host.as_str();
        let record = self.acquire(host, request.kind).await?;

        let started = Instant::now();
        let result = record.session.exec(&request.command, request.timeout).await;
        let latency = started.elapsed();

        if request.kind != CommandKind::Keepalive {
            record.touch();
        }

        match result {
            Ok(output) => match output.exit_code {
                // 后台命令可能不返回退出码，视为成功
                Some(0) | None => {
                    record.record_command(latency, true);
                    Ok(sanitize_output(&output.stdout))
                }
                Some(code) => {
                    record.record_command(latency, false);
                    debug!("Command on {} exited with {}: {}", host, code, request.command);
                    Err(PoolError::CommandFailed {
                        exit_code: code,
                        stderr: sanitize_output(&output.stderr),
                    })
                }
            },
            Err(SshError::Timeout(_)) => {
                record.record_command(latency, false);
                Err(PoolError::Timeout {
                    host: host.to_string(),
                    timeout_ms: request.timeout.as_millis() as u64,
                })
            }
            Err(e) if e.is_transport_lost() => {
                warn!("Session {} for {} lost: {}", record.record_id, host, e);
                self.retire(host, &record).await;
                Err(PoolError::ConnectionClosed(host.to_string()))
            }
            Err(e) => {
                record.record_command(latency, false);
                Err(PoolError::Channel(e.to_string()))
            }
        }
    }

    /// End the host's transport, fault queued commands, forget the attempt counter
    pub async fn close_connection(&self, host: &str) {
        self.queue.cancel_host(host);
        self.attempts.remove(host);
        if let Some((_, record)) = self.sessions.remove(host) {
            info!("Closing session {} for {}", record.record_id, host);
            record.mark_dead();
            record.session.close().await;
        }
    }

    pub async fn close_all(&self) {
        let hosts: Vec<String> = self.sessions.iter().map(|r| r.key().clone()).collect();
        for host in hosts {
            self.close_connection(&host).await;
        }
    }

    /// Probe sessions unused for longer than the keepalive idle threshold
    pub(crate) async fn run_keepalive_pass(&self) {
        let threshold = self.config.keepalive_idle();
        let candidates: Vec<Arc<SessionRecord>> = self
            .sessions
            .iter()
            .filter(|r| r.idle_for() > threshold)
            .map(|r| r.value().clone())
            .collect();

        if candidates.is_empty() {
            return;
        }
        debug!("Keepalive probing {} idle session(s)", candidates.len());

        join_all(candidates.iter().map(|record| async move {
            let request = CommandRequest {
                host: record.host_id.clone(),
                command: self.config.probe_command.clone(),
                timeout: self.config.probe_timeout(),
                kind: CommandKind::Keepalive,
            };
            if let Err(e) = self.queue.enqueue(request).await {
                warn!("Keepalive for {} failed, closing session: {}", record.host_id, e);
                self.retire(&record.host_id, record).await;
            }
        }))
        .await;
    }

    /// Close sessions idle beyond the connection timeout. Returns how many.
    pub(crate) async fn reap_idle(&self) -> usize {
        let timeout = self.config.connection_timeout();
        let idle: Vec<Arc<SessionRecord>> = self
            .sessions
            .iter()
            .filter(|r| r.idle_for() >= timeout)
            .map(|r| r.value().clone())
            .collect();

        for record in &idle {
            info!(
                "Reaping idle session {} for {} (idle {:?})",
                record.record_id,
                record.host_id,
                record.idle_for()
            );
            self.retire(&record.host_id, record).await;
        }
        idle.len()
    }

    /// Read-only pool snapshot
    pub fn status(&self) -> PoolStatus {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|r| {
                let host = r.key();
                r.value()
                    .to_info(self.queue.depth(host), self.queue.is_busy(host))
            })
            .collect();
        sessions.sort_by(|a, b| a.host_id.cmp(&b.host_id));

        let now = Instant::now();
        let max = self.config.max_connection_attempts;
        let window = self.config.attempt_window();
        let mut rate_limited_hosts: Vec<String> = self
            .attempts
            .iter()
            .filter(|c| c.count >= max && !c.is_expired(now, window))
            .map(|c| c.key().clone())
            .collect();
        rate_limited_hosts.sort();

        let mut busy_hosts = self.queue.busy_hosts();
        busy_hosts.sort();

        PoolStatus {
            generated_at: Utc::now(),
            total_sessions: sessions.len(),
            alive_sessions: sessions.iter().filter(|s| s.alive).count(),
            total_queue_depth: self.queue.total_depth(),
            busy_hosts,
            failing_hosts: self.failures.len(),
            rate_limited_hosts,
            sessions,
        }
    }

    /// Aggregated latency / success report
    pub fn performance_report(&self) -> PerformanceReport {
        let now = Utc::now();
        let mut hosts: Vec<HostPerformance> = self
            .sessions
            .iter()
            .map(|r| HostPerformance {
                host_id: r.host_id.clone(),
                display_name: r.display_name.clone(),
                command_count: r.command_count(),
                failed_commands: r.failed_commands(),
                success_rate: r.success_rate(),
                avg_latency_ms: r.avg_latency_ms(),
                quality: r.quality(),
                uptime_secs: (now - r.created_at).num_seconds(),
            })
            .collect();
        hosts.sort_by(|a, b| a.host_id.cmp(&b.host_id));

        let total_commands: u64 = hosts.iter().map(|h| h.command_count).sum();
        let failed_commands: u64 = hosts.iter().map(|h| h.failed_commands).sum();
        let total_latency: f64 = hosts
            .iter()
            .filter_map(|h| h.avg_latency_ms.map(|avg| avg * h.command_count as f64))
            .sum();

        let mut tiers = BTreeMap::new();
        for host in &hosts {
            *tiers.entry(host.quality.as_str().to_string()).or_insert(0) += 1;
        }

        PerformanceReport {
            generated_at: now,
            total_commands,
            failed_commands,
            success_rate: if total_commands == 0 {
                1.0
            } else {
                (total_commands - failed_commands) as f64 / total_commands as f64
            },
            avg_latency_ms: (total_commands > 0).then(|| total_latency / total_commands as f64),
            tiers,
            hosts,
            failures: self.failures.snapshot(),
        }
    }
}

#[async_trait]
impl CommandExecutor for ConnectionPool {
    async fn execute(&self, request: &CommandRequest) -> Result<String, PoolError> {
        self.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{resolver_with, FakeConnector};

    fn pool_with(connector: &Arc<FakeConnector>, config: EngineAccessConfig) -> Arc<ConnectionPool> {
        ConnectionPool::new(
            &config,
            resolver_with(&[("web-1", "10.0.0.1"), ("web-2", "10.0.0.2")]),
            connector.clone(),
        )
    }

    fn fast_config() -> EngineAccessConfig {
        let mut config = EngineAccessConfig::default();
        config.queue.inter_command_delay_ms = 1;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_connection_reuses_session() {
        let connector = Arc::new(FakeConnector::new());
        let pool = pool_with(&connector, fast_config());

        let first = pool.get_connection("web-1").await.unwrap();
        let second = pool.get_connection("web-1").await.unwrap();
        assert_eq!(first.record_id, second.record_id);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_creators_share_one_session() {
        let connector = Arc::new(FakeConnector::new().with_connect_delay(Duration::from_millis(50)));
        let pool = pool_with(&connector, fast_config());

        let (a, b, c) = tokio::join!(
            pool.get_connection("web-1"),
            pool.get_connection("web-1"),
            pool.get_connection("web-1")
        );
        let ids = [a.unwrap().record_id.clone(), b.unwrap().record_id.clone(), c.unwrap().record_id.clone()];
        assert!(ids.iter().all(|id| id == &ids[0]));
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_and_exit_code() {
        let connector = Arc::new(FakeConnector::new());
        let pool = pool_with(&connector, fast_config());

        let out = pool
            .enqueue_command("web-1", "echo ok", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out, "ok");

        let err = pool
            .enqueue_command("web-1", "exit 7", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::CommandFailed { exit_code: 7, .. }));

        // command faults keep the session
        let record = pool.session_record("web-1").unwrap();
        assert!(record.is_alive());
        assert_eq!(record.command_count(), 2);
        assert_eq!(record.failed_commands(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_exit_code_is_success() {
        let connector = Arc::new(FakeConnector::new());
        let pool = pool_with(&connector, fast_config());

        let out = pool
            .execute_command("web-1", "detach nohup thing", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credentials_fail_fast() {
        let connector = Arc::new(FakeConnector::new());
        let resolver = Arc::new(crate::credentials::StaticCredentialResolver::new());
        resolver.insert(HostCredentials::new("bare", "10.0.0.9", "root"));
        let pool = ConnectionPool::new(&fast_config(), resolver, connector.clone());

        let err = pool.get_connection("bare").await.unwrap_err();
        assert!(matches!(err, PoolError::Credential { .. }));
        assert_eq!(connector.connect_count(), 0);
        assert!(!pool.failure_tracker().is_failing("bare"));

        let err = pool.get_connection("unknown").await.unwrap_err();
        assert!(matches!(err, PoolError::Credential { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host_rate_limited_after_max_attempts() {
        let connector = Arc::new(FakeConnector::new());
        connector.set_failing(true);
        let pool = pool_with(&connector, fast_config());

        let err = pool.get_connection("web-1").await.unwrap_err();
        match err {
            PoolError::RateLimited {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 5);
                assert!(last_error.contains("refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(connector.connect_count(), 5);
        assert_eq!(pool.failure_tracker().get("web-1").unwrap().count, 5);

        // still inside the window: rejected without another attempt
        assert!(matches!(
            pool.get_connection("web-1").await,
            Err(PoolError::RateLimited { .. })
        ));
        assert_eq!(connector.connect_count(), 5);
        assert_eq!(pool.status().rate_limited_hosts, vec!["web-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_handshake_times_out() {
        let connector =
            Arc::new(FakeConnector::new().with_connect_delay(Duration::from_secs(600)));
        let mut config = fast_config();
        config.pool.max_connection_attempts = 1;
        let pool = pool_with(&connector, config);

        let started = Instant::now();
        let err = pool.get_connection("web-1").await.unwrap_err();
        match err {
            PoolError::RateLimited { last_error, .. } => {
                assert!(last_error.contains("handshake did not complete"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(35));
        assert_eq!(connector.connect_count(), 1);
        assert!(pool.session_record("web-1").is_none());
        assert_eq!(pool.failure_tracker().get("web-1").unwrap().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credentials_are_not_retried() {
        let connector = Arc::new(FakeConnector::new());
        connector.set_rejecting(true);
        let pool = pool_with(&connector, fast_config());

        let err = pool.get_connection("web-1").await.unwrap_err();
        match &err {
            PoolError::Connection { host, reason } => {
                assert_eq!(host, "web-1");
                assert!(reason.contains("permission denied"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(pool.failure_tracker().get("web-1").unwrap().count, 1);

        // The server lets us in again once the credentials are fixed
        connector.set_rejecting(false);
        pool.get_connection("web-1").await.unwrap();
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout_keeps_session() {
        let connector =
            Arc::new(FakeConnector::new().with_exec_delay(Duration::from_secs(5)));
        let pool = pool_with(&connector, fast_config());

        let err = pool
            .execute_command("web-1", "sleep 5", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PoolError::Timeout { ref host, timeout_ms: 1000 } if host == "web-1"
        ));

        let record = pool.session_record("web-1").unwrap();
        assert!(record.is_alive());
        let report = pool.performance_report();
        assert_eq!(report.hosts[0].failed_commands, 1);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_abandons_in_flight_exec() {
        let connector =
            Arc::new(FakeConnector::new().with_exec_delay(Duration::from_secs(5)));
        let pool = pool_with(&connector, fast_config());
        pool.get_connection("web-1").await.unwrap();

        let running = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.enqueue_command("web-1", "echo slow", Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let session = connector.last_session().unwrap();
        assert_eq!(session.abandoned_execs(), 0);

        pool.close_connection("web-1").await;
        assert!(matches!(
            running.await.unwrap(),
            Err(PoolError::ConnectionClosed(_))
        ));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(session.abandoned_execs(), 1);
        assert!(session.executed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_reaped_then_recreated() {
        let connector = Arc::new(FakeConnector::new());
        let pool = pool_with(&connector, fast_config());

        let first = pool.get_connection("web-1").await.unwrap();
        tokio::time::advance(Duration::from_secs(31 * 60)).await;

        assert_eq!(pool.reap_idle().await, 1);
        assert!(pool.session_record("web-1").is_none());
        assert!(!first.is_alive());

        let second = pool.get_connection("web-1").await.unwrap();
        assert_ne!(first.record_id, second.record_id);
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_close_removes_record() {
        let connector = Arc::new(FakeConnector::new());
        let pool = pool_with(&connector, fast_config());

        pool.get_connection("web-1").await.unwrap();
        connector.last_session().unwrap().drop_transport();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(pool.session_record("web-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_faults_pending_queue() {
        let connector =
            Arc::new(FakeConnector::new().with_exec_delay(Duration::from_secs(5)));
        let pool = pool_with(&connector, fast_config());
        pool.get_connection("web-1").await.unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    pool.enqueue_command("web-1", &format!("echo {}", i), Duration::from_secs(30))
                        .await
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.queue().depth("web-1"), 3);

        pool.close_connection("web-1").await;

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, PoolError::ConnectionClosed(_)));
        }
        assert_eq!(pool.status().total_queue_depth, 0);
        assert!(pool.session_record("web-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_commands_never_overlap_on_session() {
        let connector =
            Arc::new(FakeConnector::new().with_exec_delay(Duration::from_millis(20)));
        let pool = pool_with(&connector, fast_config());

        let results = join_all((0..6).map(|i| {
            let pool = pool.clone();
            async move {
                pool.enqueue_command("web-1", &format!("echo {}", i), Duration::from_secs(10))
                    .await
            }
        }))
        .await;
        assert!(results.iter().all(|r| r.is_ok()));

        let session = connector.last_session().unwrap();
        assert_eq!(session.max_concurrency(), 1);
        assert_eq!(session.executed().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_failure_retires_session() {
        let connector = Arc::new(FakeConnector::new());
        let mut config = fast_config();
        config.pool.probe_command = "exit 1".to_string();
        let pool = pool_with(&connector, config);

        pool.get_connection("web-1").await.unwrap();

        // recently used sessions are skipped
        pool.run_keepalive_pass().await;
        assert!(pool.session_record("web-1").is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        pool.run_keepalive_pass().await;
        assert!(pool.session_record("web-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_does_not_refresh_idle_time() {
        let connector = Arc::new(FakeConnector::new());
        let pool = pool_with(&connector, fast_config());

        let record = pool.get_connection("web-1").await.unwrap();
        tokio::time::advance(Duration::from_secs(90)).await;
        pool.run_keepalive_pass().await;

        assert!(record.is_alive());
        assert!(record.idle_for() >= Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_pass_clears_recovered_host() {
        let connector = Arc::new(FakeConnector::new());
        let mut config = fast_config();
        config.pool.max_connection_attempts = 1;
        let pool = pool_with(&connector, config);

        connector.set_failing(true);
        assert!(pool.get_connection("web-1").await.is_err());
        assert!(pool.failure_tracker().is_failing("web-1"));

        // not due yet: nothing probed
        connector.set_failing(false);
        let pass = pool.recovery.run_pass(&pool).await;
        assert_eq!(pass.probed, 0);
        assert_eq!(connector.connect_count(), 1);

        // past both the failure backoff and the attempt window
        tokio::time::advance(Duration::from_secs(301)).await;
        let pass = pool.recovery.run_pass(&pool).await;
        assert_eq!(pass.probed, 1);
        assert_eq!(pass.recovered, 1);
        assert!(!pool.failure_tracker().is_failing("web-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_and_report() {
        let connector = Arc::new(FakeConnector::new());
        let pool = pool_with(&connector, fast_config());

        pool.enqueue_command("web-1", "echo a", Duration::from_secs(5))
            .await
            .unwrap();
        pool.enqueue_command("web-2", "echo b", Duration::from_secs(5))
            .await
            .unwrap();

        let status = pool.status();
        assert_eq!(status.total_sessions, 2);
        assert_eq!(status.alive_sessions, 2);
        assert_eq!(status.sessions[0].host_id, "web-1");

        let report = pool.performance_report();
        assert_eq!(report.total_commands, 2);
        assert_eq!(report.failed_commands, 0);
        assert_eq!(report.hosts.len(), 2);
        assert_eq!(report.tiers.values().sum::<usize>(), 2);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["hosts"].is_array());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_everything() {
        let connector = Arc::new(FakeConnector::new());
        let pool = pool_with(&connector, fast_config());
        pool.start();

        let record = pool.get_connection("web-1").await.unwrap();
        pool.shutdown().await;

        assert!(!record.is_alive());
        assert!(pool.session_record("web-1").is_none());
        assert!(matches!(
            pool.get_connection("web-1").await,
            Err(PoolError::ShutDown)
        ));
        assert!(connector.last_session().unwrap().is_closed());
    }
}
