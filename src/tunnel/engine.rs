//! Engine client wrapper
//!
//! Thin wrapper over `bollard::Docker` that remembers how it reaches the
//! engine, so callers can tell a local socket from a tunneled endpoint.

use bollard::{Docker, API_DEFAULT_VERSION};
use serde::Serialize;

use super::TunnelError;

/// Where an engine client points
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEndpoint {
    /// Engine socket on this machine
    LocalSocket { path: String },
    /// Loopback listener relayed to a remote host
    Tunneled { local_port: u16 },
}

/// Container engine client for one host
#[derive(Debug, Clone)]
pub struct EngineClient {
    docker: Docker,
    endpoint: EngineEndpoint,
}

impl EngineClient {
    /// Client bound to a local engine socket
    pub fn local_socket(path: &str, timeout_secs: u64) -> Result<Self, TunnelError> {
        let docker = Docker::connect_with_unix(path, timeout_secs, API_DEFAULT_VERSION)?;
        Ok(Self {
            docker,
            endpoint: EngineEndpoint::LocalSocket {
                path: path.to_string(),
            },
        })
    }

    /// Client bound to `tcp://127.0.0.1:<local_port>`
    pub fn tunneled(local_port: u16, timeout_secs: u64) -> Result<Self, TunnelError> {
        let addr = format!("tcp://127.0.0.1:{}", local_port);
        let docker = Docker::connect_with_http(&addr, timeout_secs, API_DEFAULT_VERSION)?;
        Ok(Self {
            docker,
            endpoint: EngineEndpoint::Tunneled { local_port },
        })
    }

    pub fn endpoint(&self) -> &EngineEndpoint {
        &self.endpoint
    }

    pub fn is_tunneled(&self) -> bool {
        matches!(self.endpoint, EngineEndpoint::Tunneled { .. })
    }

    /// Access the inner bollard client
    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    pub fn into_docker(self) -> Docker {
        self.docker
    }

    /// Round-trip `/_ping` to the engine
    pub async fn ping(&self) -> Result<(), TunnelError> {
        self.docker.ping().await?;
        Ok(())
    }
}
