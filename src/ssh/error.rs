//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Whether the error means the underlying transport is gone and the
    /// session must not be reused.
    pub fn is_transport_lost(&self) -> bool {
        matches!(
            self,
            SshError::Disconnected | SshError::IoError(_) | SshError::ProtocolError(_)
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => SshError::Disconnected,
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_maps_to_transport_loss() {
        let err: SshError = russh::Error::Disconnect.into();
        assert!(matches!(err, SshError::Disconnected));
        assert!(err.is_transport_lost());
    }

    #[test]
    fn test_channel_error_keeps_session() {
        let err = SshError::ChannelError("open refused".into());
        assert!(!err.is_transport_lost());
        assert_eq!(err.to_string(), "Channel error: open refused");
    }
}
