//! SSH Client implementation using russh

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::borrow::Cow;

use russh::{cipher, client, kex, mac, Preferred};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::handle_owner::spawn_handle_owner_task;
use super::session::{RemoteSession, RusshSession, SessionConnector};

/// Modern algorithms first, then the older ones bastions and SSH proxies
/// still tend to offer
pub(crate) fn negotiation_preferences() -> Preferred {
    Preferred {
        kex: Cow::Owned(vec![
            kex::CURVE25519,
            kex::CURVE25519_PRE_RFC_8731,
            kex::ECDH_SHA2_NISTP256,
            kex::ECDH_SHA2_NISTP384,
            kex::ECDH_SHA2_NISTP521,
            kex::DH_GEX_SHA256,
            kex::DH_G16_SHA512,
            kex::DH_G14_SHA256,
            kex::DH_G14_SHA1,
            kex::EXTENSION_SUPPORT_AS_CLIENT,
            kex::EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT,
        ]),
        cipher: Cow::Owned(vec![
            cipher::CHACHA20_POLY1305,
            cipher::AES_256_GCM,
            cipher::AES_128_GCM,
            cipher::AES_256_CTR,
            cipher::AES_192_CTR,
            cipher::AES_128_CTR,
            cipher::AES_256_CBC,
            cipher::AES_128_CBC,
        ]),
        mac: Cow::Owned(vec![
            mac::HMAC_SHA512_ETM,
            mac::HMAC_SHA256_ETM,
            mac::HMAC_SHA512,
            mac::HMAC_SHA256,
            mac::HMAC_SHA1_ETM,
            mac::HMAC_SHA1,
        ]),
        ..Preferred::DEFAULT
    }
}

/// SSH client for a single connection attempt
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect to the SSH server, authenticate, and hand the russh Handle to
    /// its owner task.
    pub async fn connect(self) -> Result<RusshSession, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::task::spawn_blocking({
            let addr = addr.clone();
            move || addr.to_socket_addrs()
        })
        .await
        .map_err(|e| SshError::ConnectionFailed(format!("Address resolution aborted: {}", e)))?
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
        .next()
        .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let keepalive_interval = match self.config.keepalive_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let ssh_config = client::Config {
            // Liveness is tracked by transport keepalives and the pool's probe
            inactivity_timeout: None,
            keepalive_interval,
            keepalive_max: 3,
            preferred: negotiation_preferences(),
            ..Default::default()
        };

        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.host_key_fingerprint.clone(),
            closed_tx.clone(),
        );

        let mut handle = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| {
            SshError::Timeout(format!(
                "Handshake with {} timed out after {}s",
                addr, self.config.timeout_secs
            ))
        })?
        .map_err(|e| match e {
            SshError::HostKeyRejected(reason) => SshError::HostKeyRejected(reason),
            other => SshError::ConnectionFailed(other.to_string()),
        })?;

        debug!("SSH handshake completed with {}", addr);

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                private_key,
                passphrase,
            } => {
                let key = russh::keys::decode_secret_key(private_key, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;

                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(format!(
                "{} authentication rejected by {}",
                self.config.auth.kind(),
                addr
            )));
        }

        info!(
            "SSH authentication successful for {}@{}",
            self.config.username, addr
        );

        let session_id = uuid::Uuid::new_v4().to_string();
        let controller = spawn_handle_owner_task(handle, session_id.clone(), closed_tx);

        Ok(RusshSession::new(session_id, controller))
    }
}

/// Production connector: opens real SSH sessions with russh.
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshConnector;

#[async_trait]
impl SessionConnector for RusshConnector {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteSession>, SshError> {
        let session = SshClient::new(config.clone()).connect().await?;
        Ok(Arc::new(session))
    }
}

/// Client handler for russh callbacks
///
/// Verifies the server key against an optional pinned fingerprint and reports
/// transport closure: russh drops the handler when the connection task ends.
pub struct ClientHandler {
    host: String,
    port: u16,
    expected_fingerprint: Option<String>,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        expected_fingerprint: Option<String>,
        closed_tx: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            host,
            port,
            expected_fingerprint,
            closed_tx,
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        debug!("SSH transport to {}:{} ended", self.host, self.port);
        self.closed_tx.send_replace(true);
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let actual = fingerprint(server_public_key);

        match &self.expected_fingerprint {
            Some(expected) if !fingerprints_match(expected, &actual) => {
                warn!(
                    "HOST KEY MISMATCH for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected, actual
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} is {}, expected {}",
                    self.host, self.port, actual, expected
                )))
            }
            Some(_) => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            None => {
                debug!(
                    "Accepting host key for {}:{} (fingerprint: {})",
                    self.host, self.port, actual
                );
                Ok(true)
            }
        }
    }
}

/// Compute SHA256 fingerprint of public key, OpenSSH style
pub fn fingerprint(key: &PublicKey) -> String {
    fingerprint_bytes(&key.public_key_bytes())
}

fn fingerprint_bytes(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Operators paste fingerprints with or without the `SHA256:` prefix and
/// trailing padding.
fn fingerprints_match(expected: &str, actual: &str) -> bool {
    let normalize = |s: &str| {
        s.trim()
            .trim_start_matches("SHA256:")
            .trim_end_matches('=')
            .to_string()
    };
    normalize(expected) == normalize(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_prefers_modern_but_keeps_fallbacks() {
        let prefs = negotiation_preferences();
        assert_eq!(prefs.kex.first(), Some(&kex::CURVE25519));
        assert!(prefs.kex.contains(&kex::DH_G14_SHA1));
        assert!(prefs.kex.contains(&kex::EXTENSION_SUPPORT_AS_CLIENT));
        assert!(!prefs.kex.contains(&kex::EXTENSION_SUPPORT_AS_SERVER));
        assert_eq!(prefs.cipher.first(), Some(&cipher::CHACHA20_POLY1305));
        assert!(prefs.cipher.contains(&cipher::AES_128_CBC));
        assert!(prefs.mac.contains(&mac::HMAC_SHA1));
        assert_eq!(prefs.key.len(), Preferred::DEFAULT.key.len());
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint_bytes(b"not really a key");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn test_fingerprint_normalization() {
        let fp = fingerprint_bytes(b"server key");
        let bare = fp.trim_start_matches("SHA256:").to_string();
        assert!(fingerprints_match(&fp, &fp));
        assert!(fingerprints_match(&bare, &fp));
        assert!(fingerprints_match(&format!("{}=", fp), &fp));
        assert!(!fingerprints_match("SHA256:AAAA", &fp));
    }

    #[test]
    fn test_handler_drop_marks_closed() {
        let (tx, rx) = watch::channel(false);
        let handler = ClientHandler::new("h".into(), 22, None, Arc::new(tx));
        drop(handler);
        assert!(*rx.borrow());
    }
}
