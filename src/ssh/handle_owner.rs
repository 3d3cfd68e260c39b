//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. All other components
//! communicate with it via `HandleController` which sends commands through
//! an mpsc channel.
//!
//! This avoids:
//! - `Arc<Mutex<Handle>>` lock contention
//! - Deadlocks from holding locks across `.await`
//! - Protocol violations from concurrent Handle access

use std::sync::Arc;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (for exec)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (for local forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (copies the Sender). Anything holding a controller has
/// full control of the connection, so it never leaves the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Flips to `true` once the transport is gone, either because the owner
    /// task ended or because russh dropped the client handler.
    closed_rx: watch::Receiver<bool>,
}

impl HandleController {
    /// Create a controller around raw channels (tests only; production code
    /// goes through `spawn_handle_owner_task`).
    #[cfg(test)]
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>, closed_rx: watch::Receiver<bool>) -> Self {
        Self { cmd_tx, closed_rx }
    }

    /// Subscribe to transport closure.
    ///
    /// The receiver observes the current value immediately, so a late
    /// subscriber still sees a connection that closed before it subscribed.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| match e {
                russh::Error::Disconnect => SshError::Disconnected,
                other => SshError::ChannelError(other.to_string()),
            })
    }

    /// Open a direct-tcpip channel (for local forward)
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| match e {
                russh::Error::Disconnect => SshError::Disconnected,
                other => SshError::ChannelError(other.to_string()),
            })
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Check if the Handle Owner Task is still running and the transport open
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed() && !*self.closed_rx.borrow()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for sending
/// commands. `closed_tx` is shared with the `ClientHandler`, so either side can
/// report the transport as gone.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
    closed_tx: Arc<watch::Sender<bool>>,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let closed_rx = closed_tx.subscribe();
    let mut transport_rx = closed_tx.subscribe();

    tokio::spawn(async move {
        info!("Handle owner task started for session {}", session_id);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                        let result = handle.channel_open_session().await;
                        if reply_tx.send(result).is_err() {
                            warn!("Caller dropped before receiving channel_open_session result");
                        }
                    }
                    Some(HandleCommand::ChannelOpenDirectTcpip {
                        host,
                        port,
                        originator_host,
                        originator_port,
                        reply_tx,
                    }) => {
                        let result = handle
                            .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                            .await;
                        if reply_tx.send(result).is_err() {
                            warn!("Caller dropped before receiving direct_tcpip result");
                        }
                    }
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for session {}", session_id);
                        break;
                    }
                    None => {
                        info!("All controllers dropped for session {}", session_id);
                        break;
                    }
                },
                changed = transport_rx.changed() => {
                    if changed.is_err() || *transport_rx.borrow() {
                        warn!("Transport closed underneath session {}", session_id);
                        break;
                    }
                }
            }
        }

        // === Cleanup phase ===
        closed_tx.send_replace(true);
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        debug!("Handle owner task terminated for session {}", session_id);
    });

    HandleController { cmd_tx, closed_rx }
}

/// Drain all pending commands, returning Disconnect error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_receiver_reports_disconnect() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = watch::channel(false);
        let controller = HandleController::new(cmd_tx, closed_rx);
        assert!(controller.is_connected());

        closed_tx.send(true).unwrap();
        assert!(!controller.is_connected());
        assert!(*controller.subscribe_closed().borrow());
    }

    #[tokio::test]
    async fn test_dropped_owner_yields_disconnected() {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let (_closed_tx, closed_rx) = watch::channel(false);
        let controller = HandleController::new(cmd_tx, closed_rx);
        drop(cmd_rx);

        assert!(!controller.is_connected());
        let err = controller.open_session_channel().await.unwrap_err();
        assert!(matches!(err, SshError::Disconnected));
    }
}
