//! Engine tunnel module
//!
//! Bridges a bollard client to a remote engine socket:
//! local TCP listener -> direct-tcpip channel -> remote socat relay -> engine socket.

mod engine;
mod manager;
mod relay;

pub use engine::{EngineClient, EngineEndpoint};
pub use manager::{is_loopback_address, TunnelInfo, TunnelManager, TunnelRecord, TunnelState};
pub use relay::{CommandRunner, PackageManager, RelayBootstrap, RelayStatus};

use crate::pool::PoolError;

/// Tunnel errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Container engine on {host} is not answering at {socket}")]
    EngineUnavailable { host: String, socket: String },

    #[error("No supported package manager on {0}")]
    NoPackageManager(String),

    #[error("Failed to install socat on {host}: {reason}")]
    RelayInstall { host: String, reason: String },

    #[error("Relay on {host}:{port} did not become ready")]
    RelayNotReady { host: String, port: u16 },

    #[error("No free relay port on {host} after {attempts} tries")]
    PortExhausted { host: String, attempts: u32 },

    #[error("Failed to bind local listener: {0}")]
    Bind(String),

    #[error("Engine client error: {0}")]
    Engine(String),

    #[error("Engine tunnel to {host} unavailable after {attempts} attempts: {last_error}")]
    Unavailable {
        host: String,
        attempts: u32,
        last_error: String,
    },
}

impl From<bollard::errors::Error> for TunnelError {
    fn from(err: bollard::errors::Error) -> Self {
        TunnelError::Engine(err.to_string())
    }
}
