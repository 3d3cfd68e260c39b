//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through SSH.
//! Example: local 127.0.0.1:<ephemeral> -> remote 127.0.0.1:<relay port>

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ssh::{wait_closed, RemoteSession, SshError};

/// Local port forwarding configuration
#[derive(Debug, Clone)]
pub struct LocalForward {
    /// Local address to bind to (e.g., "127.0.0.1:0")
    pub local_addr: String,
    /// Remote host to connect to through SSH, as seen from the remote side
    pub remote_host: String,
    /// Remote port to connect to
    pub remote_port: u16,
}

impl LocalForward {
    pub fn new(
        local_addr: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            local_addr: local_addr.into(),
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// Forward an OS-assigned loopback port to the remote side's loopback
    pub fn ephemeral_loopback(remote_port: u16) -> Self {
        Self::new("127.0.0.1:0", "127.0.0.1", remote_port)
    }
}

/// Statistics for a port forward
#[derive(Debug, Clone, Default, Serialize)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (client -> server)
    pub bytes_sent: u64,
    /// Total bytes received (server -> client)
    pub bytes_received: u64,
}

/// Called whenever a forwarded connection opens or closes
pub type ActivityHook = Arc<dyn Fn() + Send + Sync>;

/// Handle to a running local port forward
pub struct LocalForwardHandle {
    pub config: LocalForward,
    /// Actual bound address (differs from requested when port was 0)
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    /// Cancels the accept loop and every spliced connection
    stop: CancellationToken,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
}

impl LocalForwardHandle {
    pub fn local_port(&self) -> u16 {
        self.bound_addr.port()
    }

    /// Stop the forward and wait for active connections to close
    pub async fn stop(&self) {
        info!("Stopping local port forward on {}", self.bound_addr);
        self.running.store(false, Ordering::SeqCst);
        self.stop.cancel();

        // 等待所有活跃连接关闭（最多等待 5 秒）
        let start = tokio::time::Instant::now();
        let timeout = Duration::from_secs(5);
        while self.stats.read().active_connections > 0 {
            if start.elapsed() > timeout {
                warn!(
                    "Timeout waiting for {} active connections to close on {}",
                    self.stats.read().active_connections,
                    self.bound_addr
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Check if the forward is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }
}

impl Drop for LocalForwardHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Start local port forwarding
///
/// Spawns a background task that:
/// 1. Listens on the local address
/// 2. For each incoming connection, opens a direct-tcpip channel through SSH
/// 3. Splices the local socket and the channel until either side closes
///
/// The task ends when the session's transport closes or `stop()` is called.
pub async fn start_local_forward(
    session: Arc<dyn RemoteSession>,
    config: LocalForward,
) -> Result<LocalForwardHandle, SshError> {
    start_local_forward_with_activity(session, config, None).await
}

/// Same as [`start_local_forward`], calling `activity` on every accept and close
pub async fn start_local_forward_with_activity(
    session: Arc<dyn RemoteSession>,
    config: LocalForward,
    activity: Option<ActivityHook>,
) -> Result<LocalForwardHandle, SshError> {
    let listener = TcpListener::bind(&config.local_addr)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => SshError::ConnectionFailed(format!(
                "Port already in use: {}",
                config.local_addr
            )),
            std::io::ErrorKind::PermissionDenied => SshError::ConnectionFailed(format!(
                "Permission denied binding to {}",
                config.local_addr
            )),
            _ => SshError::ConnectionFailed(format!(
                "Failed to bind to {}: {}",
                config.local_addr, e
            )),
        })?;

    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to get bound address: {}", e)))?;

    info!(
        "Started local port forward: {} -> {}:{}",
        bound_addr, config.remote_host, config.remote_port
    );

    let running = Arc::new(AtomicBool::new(true));
    let stop = CancellationToken::new();
    let stats = Arc::new(parking_lot::RwLock::new(ForwardStats::default()));

    tokio::spawn(accept_loop(
        listener,
        session,
        config.remote_host.clone(),
        config.remote_port,
        running.clone(),
        stop.clone(),
        stats.clone(),
        activity,
    ));

    Ok(LocalForwardHandle {
        config,
        bound_addr,
        running,
        stop,
        stats,
    })
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<dyn RemoteSession>,
    remote_host: String,
    remote_port: u16,
    running: Arc<AtomicBool>,
    stop: CancellationToken,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
    activity: Option<ActivityHook>,
) {
    let mut closed_rx = session.subscribe_closed();

    loop {
        tokio::select! {
            _ = wait_closed(&mut closed_rx) => {
                info!("Local port forward stopped: SSH disconnected");
                break;
            }

            _ = stop.cancelled() => {
                info!("Local port forward stopped by request");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        // Disable Nagle's algorithm for low-latency forwarding
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }

                        debug!("Accepted connection from {} for forward", peer_addr);

                        {
                            let mut s = stats.write();
                            s.connection_count += 1;
                            s.active_connections += 1;
                        }
                        if let Some(hook) = &activity {
                            hook();
                        }

                        let session = session.clone();
                        let activity = activity.clone();
                        let remote_host = remote_host.clone();
                        let stats = stats.clone();
                        let conn_stop = stop.child_token();

                        tokio::spawn(async move {
                            let result = tokio::select! {
                                r = handle_forward_connection(
                                    session.as_ref(),
                                    stream,
                                    &remote_host,
                                    remote_port,
                                    &stats,
                                ) => r,
                                _ = conn_stop.cancelled() => Ok(()),
                            };

                            {
                                let mut s = stats.write();
                                s.active_connections = s.active_connections.saturating_sub(1);
                            }
                            if let Some(hook) = &activity {
                                hook();
                            }

                            if let Err(e) = result {
                                warn!("Forward connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    // Tear down spliced connections as well
    stop.cancel();
    info!("Local port forward task exited");
}

async fn handle_forward_connection(
    session: &dyn RemoteSession,
    mut local_stream: TcpStream,
    remote_host: &str,
    remote_port: u16,
    stats: &parking_lot::RwLock<ForwardStats>,
) -> Result<(), SshError> {
    let mut channel = session.forward_out(remote_host, remote_port).await?;

    debug!("Opened channel for forward to {}:{}", remote_host, remote_port);

    match tokio::io::copy_bidirectional(&mut local_stream, &mut channel).await {
        Ok((sent, received)) => {
            let mut s = stats.write();
            s.bytes_sent += sent;
            s.bytes_received += received;
            debug!(
                "Forward connection closed ({} bytes out, {} bytes in)",
                sent, received
            );
            Ok(())
        }
        Err(e) => Err(SshError::IoError(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{default_script, FakeSession};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_ephemeral_loopback() {
        let forward = LocalForward::ephemeral_loopback(23750);
        assert_eq!(forward.local_addr, "127.0.0.1:0");
        assert_eq!(forward.remote_host, "127.0.0.1");
        assert_eq!(forward.remote_port, 23750);
    }

    #[tokio::test]
    async fn test_forward_splices_bytes() {
        let fake = Arc::new(FakeSession::new(default_script(), Duration::ZERO));
        let session: Arc<dyn RemoteSession> = fake.clone();
        let handle = start_local_forward(session, LocalForward::ephemeral_loopback(23750))
            .await
            .unwrap();
        assert_ne!(handle.local_port(), 0);

        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        client.write_all(b"GET /_ping").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /_ping");

        assert_eq!(fake.forwards(), vec![("127.0.0.1".to_string(), 23750)]);
        assert_eq!(handle.stats().connection_count, 1);
        handle.stop().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_refused_channel_drops_local_connection() {
        let fake = Arc::new(FakeSession::new(default_script(), Duration::ZERO));
        fake.set_refuse_forward(true);
        let session: Arc<dyn RemoteSession> = fake.clone();
        let handle = start_local_forward(session, LocalForward::ephemeral_loopback(23750))
            .await
            .unwrap();

        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        for _ in 0..50 {
            if handle.stats().active_connections == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.stats();
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.active_connections, 0);
        assert!(fake.forwards().is_empty());
        // One refused channel does not take the listener down
        assert!(handle.is_running());
    }

    #[tokio::test]
    async fn test_activity_hook_fires_on_accept_and_close() {
        let fake = Arc::new(FakeSession::new(default_script(), Duration::ZERO));
        let session: Arc<dyn RemoteSession> = fake.clone();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hook: ActivityHook = {
            let calls = calls.clone();
            Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let handle = start_local_forward_with_activity(
            session,
            LocalForward::ephemeral_loopback(23750),
            Some(hook),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(client);
        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_forward_stops_when_transport_closes() {
        let fake = Arc::new(FakeSession::new(default_script(), Duration::ZERO));
        let session: Arc<dyn RemoteSession> = fake.clone();
        let handle = start_local_forward(session, LocalForward::ephemeral_loopback(23750))
            .await
            .unwrap();

        fake.drop_transport();
        for _ in 0..50 {
            if !handle.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.is_running());
    }
}
