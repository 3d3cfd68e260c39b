//! Configuration types
//!
//! Every field carries a serde default so a partial (or empty) file is valid.
//! Durations are stored as integer seconds or milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Current configuration file version
pub const CONFIG_VERSION: u32 = 1;

/// Root configuration for the engine access layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineAccessConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl Default for EngineAccessConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            pool: PoolConfig::default(),
            queue: QueueConfig::default(),
            recovery: RecoveryConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }
}

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Sessions idle longer than this are considered unhealthy and reaped
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// SSH handshake + authentication deadline
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Transport-level keepalive interval handed to russh (0 disables)
    #[serde(default = "default_transport_keepalive_secs")]
    pub transport_keepalive_secs: u64,

    /// Period of the application-level keepalive probe
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Sessions used more recently than this are skipped by the keepalive
    #[serde(default = "default_keepalive_idle_secs")]
    pub keepalive_idle_secs: u64,

    /// Period of the idle reaper
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    /// Attempts allowed per host within `attempt_window_secs`
    #[serde(default = "default_max_connection_attempts")]
    pub max_connection_attempts: u32,

    #[serde(default = "default_attempt_window_secs")]
    pub attempt_window_secs: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Upper bound (exclusive) of the random jitter added to each delay
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,

    /// Timeout used when callers do not pass one
    #[serde(default = "default_command_timeout_ms")]
    pub default_command_timeout_ms: u64,

    /// Cheap command used by keepalive and reachability probes
    #[serde(default = "default_probe_command")]
    pub probe_command: String,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_connection_timeout_secs() -> u64 {
    30 * 60
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_transport_keepalive_secs() -> u64 {
    30
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_keepalive_idle_secs() -> u64 {
    60
}

fn default_reap_interval_secs() -> u64 {
    5 * 60
}

fn default_max_connection_attempts() -> u32 {
    5
}

fn default_attempt_window_secs() -> u64 {
    5 * 60
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_jitter_ms() -> u64 {
    1000
}

fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_probe_command() -> String {
    "echo ping".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            transport_keepalive_secs: default_transport_keepalive_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_idle_secs: default_keepalive_idle_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            max_connection_attempts: default_max_connection_attempts(),
            attempt_window_secs: default_attempt_window_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
            default_command_timeout_ms: default_command_timeout_ms(),
            probe_command: default_probe_command(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn keepalive_idle(&self) -> Duration {
        Duration::from_secs(self.keepalive_idle_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn attempt_window(&self) -> Duration {
        Duration::from_secs(self.attempt_window_secs)
    }

    pub fn default_command_timeout(&self) -> Duration {
        Duration::from_millis(self.default_command_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Per-host command queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Bounded channel capacity per host
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Pause between two commands on the same host
    #[serde(default = "default_inter_command_delay_ms")]
    pub inter_command_delay_ms: u64,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_inter_command_delay_ms() -> u64 {
    100
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            inter_command_delay_ms: default_inter_command_delay_ms(),
        }
    }
}

impl QueueConfig {
    pub fn inter_command_delay(&self) -> Duration {
        Duration::from_millis(self.inter_command_delay_ms)
    }
}

/// Recovery monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_recovery_interval_secs")]
    pub interval_secs: u64,

    /// Backoff grows by this much per recorded failure
    #[serde(default = "default_backoff_unit_secs")]
    pub backoff_unit_secs: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Failure records untouched for this long are purged
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_recovery_interval_secs() -> u64 {
    5 * 60
}

fn default_backoff_unit_secs() -> u64 {
    60
}

fn default_max_backoff_secs() -> u64 {
    60 * 60
}

fn default_stale_after_secs() -> u64 {
    24 * 60 * 60
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_recovery_interval_secs(),
            backoff_unit_secs: default_backoff_unit_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl RecoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_secs(self.backoff_unit_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Engine tunnel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Engine socket on remote hosts
    #[serde(default = "default_socket_path")]
    pub remote_socket_path: String,

    /// Engine socket used for loopback hosts
    #[serde(default = "default_socket_path")]
    pub local_socket_path: String,

    /// Inclusive range the remote relay port is drawn from
    #[serde(default = "default_relay_port_min")]
    pub relay_port_min: u16,

    #[serde(default = "default_relay_port_max")]
    pub relay_port_max: u16,

    /// How many random ports to try before giving up on a busy host
    #[serde(default = "default_port_pick_attempts")]
    pub port_pick_attempts: u32,

    /// Whole-sequence attempts before the tunnel is reported unavailable
    #[serde(default = "default_tunnel_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Timeout for each bootstrap probe command
    #[serde(default = "default_bootstrap_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Timeout for the relay package install
    #[serde(default = "default_install_timeout_ms")]
    pub install_timeout_ms: u64,

    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,

    #[serde(default = "default_verify_delay_ms")]
    pub verify_delay_ms: u64,

    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Request timeout handed to the engine client
    #[serde(default = "default_engine_timeout_secs")]
    pub engine_timeout_secs: u64,
}

fn default_socket_path() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_relay_port_min() -> u16 {
    20000
}

fn default_relay_port_max() -> u16 {
    30000
}

fn default_port_pick_attempts() -> u32 {
    5
}

fn default_tunnel_max_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_retry_max_ms() -> u64 {
    5000
}

fn default_bootstrap_probe_timeout_ms() -> u64 {
    5000
}

fn default_install_timeout_ms() -> u64 {
    180_000
}

fn default_verify_attempts() -> u32 {
    5
}

fn default_verify_delay_ms() -> u64 {
    500
}

fn default_health_check_interval_secs() -> u64 {
    60
}

fn default_engine_timeout_secs() -> u64 {
    120
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            remote_socket_path: default_socket_path(),
            local_socket_path: default_socket_path(),
            relay_port_min: default_relay_port_min(),
            relay_port_max: default_relay_port_max(),
            port_pick_attempts: default_port_pick_attempts(),
            max_attempts: default_tunnel_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            probe_timeout_ms: default_bootstrap_probe_timeout_ms(),
            install_timeout_ms: default_install_timeout_ms(),
            verify_attempts: default_verify_attempts(),
            verify_delay_ms: default_verify_delay_ms(),
            health_check_interval_secs: default_health_check_interval_secs(),
            engine_timeout_secs: default_engine_timeout_secs(),
        }
    }
}

impl TunnelConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.install_timeout_ms)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    /// Delay before retry number `attempt` (1-based count of failures so far)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_ms.saturating_mul(factor).min(self.retry_max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_yields_defaults() {
        let config: EngineAccessConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.pool.connection_timeout(), Duration::from_secs(1800));
        assert_eq!(config.pool.max_connection_attempts, 5);
        assert_eq!(config.queue.inter_command_delay(), Duration::from_millis(100));
        assert_eq!(config.recovery.max_backoff(), Duration::from_secs(3600));
        assert_eq!(config.tunnel.remote_socket_path, "/var/run/docker.sock");
    }

    #[test]
    fn test_default_carries_current_version() {
        let config = EngineAccessConfig::default();
        assert_eq!(config.version, CONFIG_VERSION);

        let json = serde_json::to_string(&config).unwrap();
        let reloaded: EngineAccessConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded.version, CONFIG_VERSION);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let json = r#"{"tunnel":{"relay_port_min":40000,"relay_port_max":40010}}"#;
        let config: EngineAccessConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.tunnel.relay_port_min, 40000);
        assert_eq!(config.tunnel.verify_attempts, 5);
        assert_eq!(config.pool.probe_command, "echo ping");
    }

    #[test]
    fn test_tunnel_retry_delay_capped() {
        let tunnel = TunnelConfig::default();
        assert_eq!(tunnel.retry_delay(1), Duration::from_secs(1));
        assert_eq!(tunnel.retry_delay(2), Duration::from_secs(2));
        assert_eq!(tunnel.retry_delay(3), Duration::from_secs(4));
        assert_eq!(tunnel.retry_delay(4), Duration::from_secs(5));
        assert_eq!(tunnel.retry_delay(30), Duration::from_secs(5));
    }
}
