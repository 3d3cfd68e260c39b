//! SSH Configuration

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// SSH connection configuration
///
/// Built by the connection pool from resolved host credentials; never
/// persisted by this crate.
#[derive(Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Handshake timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Transport keepalive interval in seconds (0 disables)
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// Expected server key fingerprint (`SHA256:<base64>`). When set, any
    /// other key is rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

/// Authentication methods supported
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// Private key authentication with in-memory key material
    Key {
        /// OpenSSH / PEM encoded private key
        private_key: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(private_key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            private_key: private_key.into(),
            passphrase,
        }
    }

    /// Short name for logs, never includes secret material
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } => "key",
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        match self {
            AuthMethod::Password { password } => password.zeroize(),
            AuthMethod::Key {
                private_key,
                passphrase,
            } => {
                private_key.zeroize();
                passphrase.zeroize();
            }
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthMethod::{}(<redacted>)", self.kind())
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth)
            .field("timeout_secs", &self.timeout_secs)
            .field("keepalive_secs", &self.keepalive_secs)
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .finish()
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    30
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: AuthMethod::Password {
                password: String::new(),
            },
            timeout_secs: 30,
            keepalive_secs: 30,
            host_key_fingerprint: None,
        }
    }
}
