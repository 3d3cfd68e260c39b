//! SSH Session abstraction
//!
//! A `RemoteSession` is one authenticated connection to one host. The pool
//! only ever talks to this trait, so tests can swap in scripted sessions.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::config::SshConfig;
use super::error::SshError;
use super::handle_owner::HandleController;

/// Byte stream usable on both sides of a forward splice
pub trait AsyncStream: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send + ?Sized> AsyncStream for T {}

/// A direct-tcpip channel exposed as a plain byte stream
pub type ForwardStream = Pin<Box<dyn AsyncStream>>;

/// Collected result of one exec channel
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the server never reported one (detached commands)
    pub exit_code: Option<u32>,
}

/// One authenticated remote-shell connection
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Session id, unique per connection
    fn id(&self) -> &str;

    /// Run a command on a fresh exec channel and wait for the channel to close
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SshError>;

    /// Open a direct-tcpip channel to `host:port` as seen from the remote side
    async fn forward_out(&self, host: &str, port: u16) -> Result<ForwardStream, SshError>;

    /// Whether the transport has gone away
    fn is_closed(&self) -> bool;

    /// Watch that flips to `true` once the transport is gone
    fn subscribe_closed(&self) -> watch::Receiver<bool>;

    /// End the transport
    async fn close(&self);
}

/// Resolve once the watched transport reports closure (or its sender is gone)
pub async fn wait_closed(closed_rx: &mut watch::Receiver<bool>) {
    while !*closed_rx.borrow_and_update() {
        if closed_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Exec channel that gets closed on the server when dropped before it finished,
/// e.g. when a queue cancellation drops the exec future mid-flight
struct ExecChannel {
    channel: Option<Channel<Msg>>,
}

impl ExecChannel {
    fn new(channel: Channel<Msg>) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    async fn exec(&mut self, command: &str) -> Result<(), russh::Error> {
        match self.channel.as_mut() {
            Some(channel) => channel.exec(true, command).await,
            None => Err(russh::Error::SendError),
        }
    }

    async fn wait(&mut self) -> Option<ChannelMsg> {
        match self.channel.as_mut() {
            Some(channel) => channel.wait().await,
            None => None,
        }
    }

    async fn close(mut self) {
        if let Some(channel) = self.channel.take() {
            let _ = channel.close().await;
        }
    }

    /// Server already closed its side
    fn finish(mut self) {
        self.channel.take();
    }
}

impl Drop for ExecChannel {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        debug!("Exec abandoned, closing channel {:?}", channel.id());
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = channel.close().await;
            });
        }
    }
}

/// Opens new sessions from connection parameters
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteSession>, SshError>;
}

/// russh-backed session, driven through the handle owner task
pub struct RusshSession {
    id: String,
    controller: HandleController,
}

impl RusshSession {
    pub fn new(id: String, controller: HandleController) -> Self {
        Self { id, controller }
    }

    pub fn controller(&self) -> &HandleController {
        &self.controller
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SshError> {
        let mut channel = ExecChannel::new(self.controller.open_session_channel().await?);

        channel
            .exec(command)
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to execute command: {}", e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code: Option<u32> = None;

        let result = tokio::time::timeout(timeout, async {
            // Exit status may arrive after EOF, so only Close ends the loop
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        stderr.extend_from_slice(&data)
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        })
        .await;

        if result.is_err() {
            warn!(
                "Exec on session {} timed out after {:?}: {}",
                self.id, timeout, command
            );
            channel.close().await;
            return Err(SshError::Timeout(format!(
                "Command timed out after {}ms",
                timeout.as_millis()
            )));
        }

        channel.finish();
        debug!(
            "Exec on session {} finished: exit={:?} stdout_len={} stderr_len={}",
            self.id,
            exit_code,
            stdout.len(),
            stderr.len()
        );

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn forward_out(&self, host: &str, port: u16) -> Result<ForwardStream, SshError> {
        let channel = self
            .controller
            .open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?;
        Ok(Box::pin(channel.into_stream()))
    }

    fn is_closed(&self) -> bool {
        !self.controller.is_connected()
    }

    fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.controller.subscribe_closed()
    }

    async fn close(&self) {
        self.controller.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_exec_on_dead_session_is_transport_loss() {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let (_closed_tx, closed_rx) = watch::channel(false);
        drop(cmd_rx);
        let session = RusshSession::new("s1".into(), HandleController::new(cmd_tx, closed_rx));

        assert!(session.is_closed());
        let err = session
            .exec("echo ok", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_transport_lost());
    }

    #[tokio::test]
    async fn test_wait_closed_returns_on_flip_and_on_drop() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_closed(&mut rx).await });
        tx.send_replace(true);
        waiter.await.unwrap();

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        wait_closed(&mut rx).await;
    }
}
