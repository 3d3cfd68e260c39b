//! dockbridge - remote container engine access over SSH
//!
//! ```text
//! RemoteEngineAccess
//!   ├── ConnectionPool ── CommandQueue ── RemoteSession (russh)
//!   │        └── RecoveryMonitor / FailureTracker
//!   └── TunnelManager ── RelayBootstrap (socat) ── LocalForward ── EngineClient (bollard)
//! ```

pub mod access;
pub mod config;
pub mod credentials;
pub mod forwarding;
pub mod pool;
pub mod ssh;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use access::{AccessStatus, FleetClients, RemoteEngineAccess};
pub use config::{ConfigStorage, EngineAccessConfig};
pub use credentials::{CredentialError, CredentialResolver, HostCredentials, StaticCredentialResolver};
pub use pool::{ConnectionPool, PerformanceReport, PoolError, PoolStatus, QualityTier};
pub use ssh::{RusshConnector, SshError};
pub use tunnel::{EngineClient, EngineEndpoint, TunnelError, TunnelManager, TunnelState};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging (`RUST_LOG` overrides the default `info` filter)
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
