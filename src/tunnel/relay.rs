//! Remote relay provisioning
//!
//! Makes sure a `socat` relay forwards the engine socket to a loopback TCP
//! port on the remote host. Every step is a shell command run through a
//! `CommandRunner`, so the whole sequence shares the host's command queue.
//!
//! Steps: existing relay? -> socat present? -> install -> free port -> launch -> verify

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::TunnelError;
use crate::config::TunnelConfig;
use crate::pool::{ConnectionPool, PoolError};

/// Runs one shell command on a host and returns its sanitized stdout
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, host: &str, command: &str, timeout: Duration) -> Result<String, PoolError>;
}

#[async_trait]
impl CommandRunner for ConnectionPool {
    async fn run(&self, host: &str, command: &str, timeout: Duration) -> Result<String, PoolError> {
        self.enqueue_command(host, command, timeout).await
    }
}

/// Package managers probed for, in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageManager {
    AptGet,
    Yum,
    Dnf,
    Zypper,
    Pacman,
}

impl PackageManager {
    pub const ALL: [PackageManager; 5] = [
        PackageManager::AptGet,
        PackageManager::Yum,
        PackageManager::Dnf,
        PackageManager::Zypper,
        PackageManager::Pacman,
    ];

    pub fn binary(&self) -> &'static str {
        match self {
            PackageManager::AptGet => "apt-get",
            PackageManager::Yum => "yum",
            PackageManager::Dnf => "dnf",
            PackageManager::Zypper => "zypper",
            PackageManager::Pacman => "pacman",
        }
    }

    pub fn from_binary(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|pm| pm.binary() == name)
    }

    /// Non-interactive socat install
    pub fn install_command(&self) -> &'static str {
        match self {
            PackageManager::AptGet => {
                "DEBIAN_FRONTEND=noninteractive apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq socat"
            }
            PackageManager::Yum => "yum install -y socat",
            PackageManager::Dnf => "dnf install -y socat",
            PackageManager::Zypper => "zypper --non-interactive install socat",
            PackageManager::Pacman => "pacman -Sy --noconfirm socat",
        }
    }
}

/// Outcome of a successful bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    /// Loopback port the relay listens on (remote side)
    pub port: u16,
    /// Relay process id, when we started it and the shell reported one
    pub pid: Option<u32>,
    /// An already running relay was reused
    pub reused: bool,
    /// socat had to be installed first
    pub installed: bool,
}

/// Single-quote a value for POSIX sh
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

pub(crate) fn engine_probe_command(socket: &str) -> String {
    let socket = shell_quote(socket);
    // wget 不支持 unix socket，没有 curl 时只能检查 socket 是否存在
    format!(
        "if command -v curl >/dev/null 2>&1; then curl -sf --max-time 5 --unix-socket {socket} http://localhost/version; else test -S {socket} && echo socket-present; fi"
    )
}

pub(crate) fn relay_probe_command(port: u16) -> String {
    format!(
        "(curl -sf --max-time 3 http://127.0.0.1:{port}/version || wget -qO- -T 3 http://127.0.0.1:{port}/version) 2>/dev/null"
    )
}

pub(crate) const SOCAT_CHECK_COMMAND: &str = "command -v socat";

pub(crate) fn detect_package_manager_command() -> String {
    let names: Vec<&str> = PackageManager::ALL.iter().map(|pm| pm.binary()).collect();
    format!(
        "for pm in {}; do if command -v $pm >/dev/null 2>&1; then echo $pm; break; fi; done",
        names.join(" ")
    )
}

pub(crate) fn install_command(pm: PackageManager) -> String {
    let cmd = pm.install_command();
    format!(
        "if [ \"$(id -u)\" -eq 0 ]; then {cmd}; else sudo -n sh -c {}; fi",
        shell_quote(cmd)
    )
}

pub(crate) fn port_check_command(port: u16) -> String {
    format!(
        "(ss -ltn 2>/dev/null || netstat -ltn 2>/dev/null) | grep -Eq '[:.]{port}[[:space:]]' && echo busy || echo free"
    )
}

pub(crate) fn launch_command(port: u16, socket: &str) -> String {
    format!(
        "nohup socat TCP-LISTEN:{port},bind=127.0.0.1,reuseaddr,fork UNIX-CONNECT:{} >/dev/null 2>&1 & echo $!",
        shell_quote(socket)
    )
}

/// Relay bootstrap for one host
pub struct RelayBootstrap<'a> {
    runner: &'a dyn CommandRunner,
    host: &'a str,
    config: &'a TunnelConfig,
}

impl<'a> RelayBootstrap<'a> {
    pub fn new(runner: &'a dyn CommandRunner, host: &'a str, config: &'a TunnelConfig) -> Self {
        Self {
            runner,
            host,
            config,
        }
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<String, PoolError> {
        debug!("[{}] relay bootstrap: {}", self.host, command);
        self.runner.run(self.host, command, timeout).await
    }

    /// Check that the remote engine socket answers
    pub async fn probe_engine(&self) -> Result<(), TunnelError> {
        let socket = &self.config.remote_socket_path;
        match self
            .run(&engine_probe_command(socket), self.config.probe_timeout())
            .await
        {
            Ok(output) if !output.is_empty() => Ok(()),
            Ok(_) | Err(PoolError::CommandFailed { .. }) => Err(TunnelError::EngineUnavailable {
                host: self.host.to_string(),
                socket: socket.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether something that looks like an engine answers on the relay port
    pub async fn relay_answers(&self, port: u16) -> Result<bool, TunnelError> {
        match self
            .run(&relay_probe_command(port), self.config.probe_timeout())
            .await
        {
            Ok(output) => Ok(output.contains("ApiVersion")),
            Err(PoolError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn has_socat(&self) -> Result<bool, TunnelError> {
        match self
            .run(SOCAT_CHECK_COMMAND, self.config.probe_timeout())
            .await
        {
            Ok(path) => Ok(!path.is_empty()),
            Err(PoolError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn detect_package_manager(&self) -> Result<PackageManager, TunnelError> {
        let output = match self
            .run(
                &detect_package_manager_command(),
                self.config.probe_timeout(),
            )
            .await
        {
            Ok(output) => output,
            Err(PoolError::CommandFailed { .. }) => String::new(),
            Err(e) => return Err(e.into()),
        };

        output
            .lines()
            .find_map(|line| PackageManager::from_binary(line.trim()))
            .ok_or_else(|| TunnelError::NoPackageManager(self.host.to_string()))
    }

    /// Install socat with the first package manager found
    pub async fn install_socat(&self) -> Result<PackageManager, TunnelError> {
        let pm = self.detect_package_manager().await?;
        info!("[{}] Installing socat with {}", self.host, pm.binary());

        match self
            .run(&install_command(pm), self.config.install_timeout())
            .await
        {
            Ok(_) => Ok(pm),
            Err(PoolError::CommandFailed { exit_code, stderr }) => Err(TunnelError::RelayInstall {
                host: self.host.to_string(),
                reason: format!("{} exited with {}: {}", pm.binary(), exit_code, stderr),
            }),
            Err(PoolError::Timeout { timeout_ms, .. }) => Err(TunnelError::RelayInstall {
                host: self.host.to_string(),
                reason: format!("{} timed out after {}ms", pm.binary(), timeout_ms),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn port_is_free(&self, port: u16) -> Result<bool, TunnelError> {
        let output = self
            .run(&port_check_command(port), self.config.probe_timeout())
            .await?;
        Ok(output.trim() != "busy")
    }

    fn random_port(&self) -> u16 {
        let (lo, hi) = if self.config.relay_port_min <= self.config.relay_port_max {
            (self.config.relay_port_min, self.config.relay_port_max)
        } else {
            (self.config.relay_port_max, self.config.relay_port_min)
        };
        rand::thread_rng().gen_range(lo..=hi)
    }

    /// First free port: the preferred one, then random picks from the range
    pub async fn pick_free_port(&self, preferred: Option<u16>) -> Result<u16, TunnelError> {
        let attempts = self.config.port_pick_attempts.max(1);
        for attempt in 0..attempts {
            let port = match preferred {
                Some(port) if attempt == 0 => port,
                _ => self.random_port(),
            };
            if self.port_is_free(port).await? {
                return Ok(port);
            }
            debug!("[{}] Relay port {} is taken", self.host, port);
        }

        Err(TunnelError::PortExhausted {
            host: self.host.to_string(),
            attempts,
        })
    }

    /// Start socat detached; returns its pid if the shell printed one
    pub async fn launch(&self, port: u16) -> Result<Option<u32>, TunnelError> {
        let output = self
            .run(
                &launch_command(port, &self.config.remote_socket_path),
                self.config.probe_timeout(),
            )
            .await?;
        Ok(output.lines().last().and_then(|l| l.trim().parse().ok()))
    }

    pub async fn verify(&self, port: u16) -> Result<(), TunnelError> {
        for attempt in 1..=self.config.verify_attempts.max(1) {
            tokio::time::sleep(self.config.verify_delay()).await;
            if self.relay_answers(port).await? {
                return Ok(());
            }
            debug!(
                "[{}] Relay on port {} not ready (check {})",
                self.host, port, attempt
            );
        }

        Err(TunnelError::RelayNotReady {
            host: self.host.to_string(),
            port,
        })
    }

    /// Run the whole sequence. Safe to repeat: a relay already answering on
    /// `preferred` is reused as is.
    pub async fn ensure_relay(&self, preferred: Option<u16>) -> Result<RelayStatus, TunnelError> {
        if let Some(port) = preferred {
            if self.relay_answers(port).await? {
                info!("[{}] Reusing relay on port {}", self.host, port);
                return Ok(RelayStatus {
                    port,
                    pid: None,
                    reused: true,
                    installed: false,
                });
            }
        }

        let mut installed = false;
        if !self.has_socat().await? {
            self.install_socat().await?;
            installed = true;
            if !self.has_socat().await? {
                return Err(TunnelError::RelayInstall {
                    host: self.host.to_string(),
                    reason: "socat still missing after install".to_string(),
                });
            }
        }

        let port = self.pick_free_port(preferred).await?;
        let pid = self.launch(port).await?;
        if pid.is_none() {
            warn!("[{}] Relay launched without a reported pid", self.host);
        }

        self.verify(port).await?;
        info!(
            "[{}] Relay ready on port {} (pid {:?})",
            self.host, port, pid
        );

        Ok(RelayStatus {
            port,
            pid,
            reused: false,
            installed,
        })
    }
}
