//! Connection Pool Module
//!
//! At most one live SSH session per host, a per-host command queue in front
//! of it, and a recovery monitor for hosts that keep failing.
//!
//! ```text
//!  caller ──► CommandQueue (per-host FIFO worker) ──► ConnectionPool::execute
//!                                                        │
//!                                   SessionRecord ◄──────┘ get_connection
//!                                        │
//!  RecoveryMonitor ── probe via queue ───┘     FailureTracker ◄── handshake failures
//! ```

mod attempts;
mod output;
mod quality;
mod queue;
mod recovery;
mod registry;

pub use attempts::{connect_backoff_delay, AttemptCounter};
pub use output::sanitize_output;
pub use quality::{quality_tier, QualityTier};
pub use queue::{CommandExecutor, CommandKind, CommandQueue, CommandRequest, QueueEntry};
pub use recovery::{FailureInfo, FailureRecord, FailureTracker, RecoveryMonitor, RecoveryPass};
pub use registry::{
    ConnectionPool, HostPerformance, PerformanceReport, PoolStatus, SessionInfo, SessionRecord,
};

use crate::credentials::CredentialError;

/// Connection pool errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("Credentials for {host} unusable: {reason}")]
    Credential { host: String, reason: String },

    /// Server refused our credentials or host key; retrying cannot help
    #[error("Connection to {host} rejected: {reason}")]
    Connection { host: String, reason: String },

    #[error("Too many connection attempts to {host} ({attempts}), last error: {last_error}")]
    RateLimited {
        host: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Command exited with code {exit_code}: {stderr}")]
    CommandFailed { exit_code: u32, stderr: String },

    #[error("Command on {host} timed out after {timeout_ms}ms")]
    Timeout { host: String, timeout_ms: u64 },

    #[error("Connection to {0} closed")]
    ConnectionClosed(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Connection pool is shut down")]
    ShutDown,
}

impl PoolError {
    pub(crate) fn credential(host: &str, err: CredentialError) -> Self {
        PoolError::Credential {
            host: host.to_string(),
            reason: err.to_string(),
        }
    }
}
