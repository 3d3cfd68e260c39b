//! Host credential resolution
//!
//! Credential storage and encryption live outside this crate. The pool only
//! sees the `CredentialResolver` seam; `StaticCredentialResolver` is the
//! in-memory implementation used by operators and tests.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::config::{hosts_file, StorageError};
use crate::ssh::{AuthMethod, SshConfig};

/// Credential resolution errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Host {0} is inactive")]
    Inactive(String),

    #[error("Host {0} has neither a password nor a private key")]
    MissingAuth(String),

    #[error("Credential lookup failed: {0}")]
    Lookup(String),
}

/// Connection parameters for one host
#[derive(Clone, Serialize, Deserialize)]
pub struct HostCredentials {
    pub host_id: String,

    #[serde(default)]
    pub display_name: String,

    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_port() -> u16 {
    22
}

fn default_active() -> bool {
    true
}

impl HostCredentials {
    pub fn new(
        host_id: impl Into<String>,
        address: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        let host_id = host_id.into();
        Self {
            display_name: host_id.clone(),
            host_id,
            address: address.into(),
            port: 22,
            username: username.into(),
            password: None,
            private_key: None,
            passphrase: None,
            host_key_fingerprint: None,
            active: true,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_private_key(mut self, key: impl Into<String>, passphrase: Option<String>) -> Self {
        self.private_key = Some(key.into());
        self.passphrase = passphrase;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Name for logs and reports
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.host_id
        } else {
            &self.display_name
        }
    }

    /// Build the SSH parameters; a private key wins over a password.
    pub fn to_ssh_config(
        &self,
        timeout_secs: u64,
        keepalive_secs: u64,
    ) -> Result<SshConfig, CredentialError> {
        let auth = match (&self.private_key, &self.password) {
            (Some(key), _) if !key.trim().is_empty() => {
                AuthMethod::key(key.clone(), self.passphrase.clone())
            }
            (_, Some(password)) if !password.is_empty() => AuthMethod::password(password.clone()),
            _ => return Err(CredentialError::MissingAuth(self.host_id.clone())),
        };

        Ok(SshConfig {
            host: self.address.clone(),
            port: self.port,
            username: self.username.clone(),
            auth,
            timeout_secs,
            keepalive_secs,
            host_key_fingerprint: self.host_key_fingerprint.clone(),
        })
    }
}

impl Drop for HostCredentials {
    fn drop(&mut self) {
        self.password.zeroize();
        self.private_key.zeroize();
        self.passphrase.zeroize();
    }
}

impl fmt::Debug for HostCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("HostCredentials")
            .field("host_id", &self.host_id)
            .field("display_name", &self.display_name)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("private_key", &redact(&self.private_key))
            .field("passphrase", &redact(&self.passphrase))
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .field("active", &self.active)
            .finish()
    }
}

/// Resolves a host id to its connection parameters
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Fails with `UnknownHost` or `Inactive` when the host cannot be used
    async fn resolve(&self, host_id: &str) -> Result<HostCredentials, CredentialError>;
}

/// In-memory resolver
#[derive(Default)]
pub struct StaticCredentialResolver {
    hosts: DashMap<String, HostCredentials>,
}

impl StaticCredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of `HostCredentials`
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        let hosts: Vec<HostCredentials> = serde_json::from_str(&contents)?;
        let resolver = Self::new();
        for host in hosts {
            resolver.insert(host);
        }
        tracing::info!(
            "Loaded {} host credentials from {:?}",
            resolver.len(),
            path.as_ref()
        );
        Ok(resolver)
    }

    /// Hosts from `~/.dockbridge/hosts.json`; no file means no hosts yet
    pub async fn load_default() -> Result<Self, StorageError> {
        Self::load_or_empty(hosts_file()?).await
    }

    pub async fn load_or_empty(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        match tokio::fs::metadata(path.as_ref()).await {
            Ok(_) => Self::from_json_file(path).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No hosts file at {:?}", path.as_ref());
                Ok(Self::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn insert(&self, credentials: HostCredentials) {
        self.hosts.insert(credentials.host_id.clone(), credentials);
    }

    pub fn remove(&self, host_id: &str) -> Option<HostCredentials> {
        self.hosts.remove(host_id).map(|(_, v)| v)
    }

    /// Mark a host (in)active without touching its secrets
    pub fn set_active(&self, host_id: &str, active: bool) -> bool {
        match self.hosts.get_mut(host_id) {
            Some(mut entry) => {
                entry.active = active;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, host_id: &str) -> Result<HostCredentials, CredentialError> {
        let entry = self
            .hosts
            .get(host_id)
            .ok_or_else(|| CredentialError::UnknownHost(host_id.to_string()))?;
        if !entry.active {
            return Err(CredentialError::Inactive(host_id.to_string()));
        }
        Ok(entry.value().clone())
    }
}
