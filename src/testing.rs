//! Scripted sessions for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::credentials::{HostCredentials, StaticCredentialResolver};
use crate::ssh::{ExecOutput, ForwardStream, RemoteSession, SessionConnector, SshConfig, SshError};

/// Maps a command to its result
pub(crate) type Script = Arc<dyn Fn(&str) -> Result<ExecOutput, SshError> + Send + Sync>;

pub(crate) fn ok(stdout: &str) -> Result<ExecOutput, SshError> {
    Ok(ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(0),
    })
}

pub(crate) fn exit(code: u32, stderr: &str) -> Result<ExecOutput, SshError> {
    Ok(ExecOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: Some(code),
    })
}

/// `echo X` prints X, `exit N` exits with N, `detach ...` reports no exit
/// code, anything else succeeds silently.
pub(crate) fn default_script() -> Script {
    Arc::new(|command: &str| {
        if let Some(rest) = command.strip_prefix("echo ") {
            return ok(&format!("{}\r\n", rest));
        }
        if let Some(code) = command.strip_prefix("exit ") {
            let code = code.trim().parse().unwrap_or(1);
            return exit(code, &format!("exited {}", code));
        }
        if command.starts_with("detach") {
            return Ok(ExecOutput::default());
        }
        ok("")
    })
}

pub(crate) struct FakeSession {
    id: String,
    script: Script,
    exec_delay: Duration,
    closed_tx: watch::Sender<bool>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    executed: Mutex<Vec<String>>,
    forwards: Mutex<Vec<(String, u16)>>,
    refuse_forward: AtomicBool,
    /// Execs whose caller stopped waiting; a real channel gets closed here
    abandoned: Arc<AtomicUsize>,
}

impl FakeSession {
    pub(crate) fn new(script: Script, exec_delay: Duration) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            script,
            exec_delay,
            closed_tx: watch::channel(false).0,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            forwards: Mutex::new(Vec::new()),
            refuse_forward: AtomicBool::new(false),
            abandoned: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Simulate the server side going away
    pub(crate) fn drop_transport(&self) {
        self.closed_tx.send_replace(true);
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub(crate) fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub(crate) fn forwards(&self) -> Vec<(String, u16)> {
        self.forwards.lock().clone()
    }

    pub(crate) fn set_refuse_forward(&self, refuse: bool) {
        self.refuse_forward.store(refuse, Ordering::SeqCst);
    }

    pub(crate) fn abandoned_execs(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }
}

/// Counts the exec as abandoned unless it ran to completion
struct InFlight {
    abandoned: Arc<AtomicUsize>,
    done: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.done {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SshError> {
        if self.is_closed() {
            return Err(SshError::Disconnected);
        }

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let mut in_flight = InFlight {
            abandoned: self.abandoned.clone(),
            done: false,
        };

        let waited = tokio::time::timeout(timeout, tokio::time::sleep(self.exec_delay)).await;
        in_flight.done = true;
        if waited.is_err() {
            return Err(SshError::Timeout(format!("{:?}", timeout)));
        }

        self.executed.lock().push(command.to_string());
        (self.script)(command)
    }

    async fn forward_out(&self, host: &str, port: u16) -> Result<ForwardStream, SshError> {
        if self.is_closed() {
            return Err(SshError::Disconnected);
        }
        if self.refuse_forward.load(Ordering::SeqCst) {
            return Err(SshError::ChannelError("open refused".to_string()));
        }
        self.forwards.lock().push((host.to_string(), port));

        // Remote end echoes everything back
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::pin(client))
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    async fn close(&self) {
        self.closed_tx.send_replace(true);
    }
}

pub(crate) struct FakeConnector {
    script: Script,
    exec_delay: Duration,
    connect_delay: Duration,
    failing: AtomicBool,
    rejecting: AtomicBool,
    connects: AtomicUsize,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::with_script(default_script())
    }

    pub(crate) fn with_script(script: Script) -> Self {
        Self {
            script,
            exec_delay: Duration::ZERO,
            connect_delay: Duration::ZERO,
            failing: AtomicBool::new(false),
            rejecting: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    pub(crate) fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Server answers but refuses the credentials
    pub(crate) fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn last_session(&self) -> Option<Arc<FakeSession>> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self, _config: &SshConfig) -> Result<Arc<dyn RemoteSession>, SshError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SshError::ConnectionFailed("connection refused".to_string()));
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(SshError::AuthenticationFailed("permission denied".to_string()));
        }
        let session = Arc::new(FakeSession::new(self.script.clone(), self.exec_delay));
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

/// Resolver with password credentials for each `(host_id, address)`
pub(crate) fn resolver_with(hosts: &[(&str, &str)]) -> Arc<StaticCredentialResolver> {
    let resolver = StaticCredentialResolver::new();
    for (host_id, address) in hosts {
        resolver.insert(HostCredentials::new(*host_id, *address, "deploy").with_password("pw"));
    }
    Arc::new(resolver)
}
