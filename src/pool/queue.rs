//! Per-host command queue
//!
//! Each host gets one worker task reading a bounded mpsc channel, so commands
//! on the same session run strictly one after another while different hosts
//! proceed independently.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::PoolError;
use crate::config::QueueConfig;

/// Who submitted a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Application command; may open a session and refreshes `last_used`
    Foreground,
    /// Keepalive probe; only runs on an existing session and never refreshes it
    Keepalive,
    /// Recovery probe; may open a session but leaves failure bookkeeping to
    /// the recovery monitor
    Recovery,
}

/// One command as handed to the executor
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub host: String,
    pub command: String,
    pub timeout: Duration,
    pub kind: CommandKind,
}

/// Executes one command against a host's session
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, request: &CommandRequest) -> Result<String, PoolError>;
}

/// A pending command
pub struct QueueEntry {
    pub request: CommandRequest,
    pub reply_tx: oneshot::Sender<Result<String, PoolError>>,
    pub enqueued_at: Instant,
}

struct HostWorker {
    tx: mpsc::Sender<QueueEntry>,
    cancel: CancellationToken,
    depth: Arc<AtomicUsize>,
    in_flight: Arc<AtomicBool>,
}

/// Per-host FIFO serializer
pub struct CommandQueue {
    workers: DashMap<String, HostWorker>,
    executor: Weak<dyn CommandExecutor>,
    config: QueueConfig,
    shutdown: CancellationToken,
}

impl CommandQueue {
    pub fn new(config: QueueConfig, executor: Weak<dyn CommandExecutor>) -> Self {
        Self {
            workers: DashMap::new(),
            executor,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Submit a command and wait for its outcome
    pub async fn enqueue(&self, request: CommandRequest) -> Result<String, PoolError> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::ShutDown);
        }

        let host = request.host.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        let entry = QueueEntry {
            request,
            reply_tx,
            enqueued_at: Instant::now(),
        };

        // 获取或创建 worker（旧 worker 已退出时替换）
        let (tx, depth) = {
            let mut worker = self
                .workers
                .entry(host.clone())
                .or_insert_with(|| self.spawn_worker(&host));
            if worker.tx.is_closed() {
                *worker = self.spawn_worker(&host);
            }
            (worker.tx.clone(), worker.depth.clone())
        };

        depth.fetch_add(1, Ordering::SeqCst);
        if tx.send(entry).await.is_err() {
            depth.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::ConnectionClosed(host));
        }

        reply_rx
            .await
            .unwrap_or_else(|_| Err(PoolError::ConnectionClosed(host)))
    }

    fn spawn_worker(&self, host: &str) -> HostWorker {
        let (tx, rx) = mpsc::channel(self.config.capacity.max(1));
        let cancel = self.shutdown.child_token();
        let depth = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_worker(
            host.to_string(),
            rx,
            self.executor.clone(),
            cancel.clone(),
            depth.clone(),
            in_flight.clone(),
            self.config.inter_command_delay(),
        ));

        HostWorker {
            tx,
            cancel,
            depth,
            in_flight,
        }
    }

    /// Stop the host's worker; the in-flight command and every pending one
    /// fault with `ConnectionClosed`.
    pub fn cancel_host(&self, host: &str) {
        if let Some((_, worker)) = self.workers.remove(host) {
            debug!(
                "Cancelling command queue for {} ({} pending)",
                host,
                worker.depth.load(Ordering::SeqCst)
            );
            worker.cancel.cancel();
        }
    }

    /// Stop every worker and reject new submissions
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.workers.clear();
    }

    /// Pending (not yet started) commands for a host
    pub fn depth(&self, host: &str) -> usize {
        self.workers
            .get(host)
            .map(|w| w.depth.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn total_depth(&self) -> usize {
        self.workers
            .iter()
            .map(|w| w.depth.load(Ordering::SeqCst))
            .sum()
    }

    /// Whether a command is currently executing for the host
    pub fn is_busy(&self, host: &str) -> bool {
        self.workers
            .get(host)
            .map(|w| w.in_flight.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn busy_hosts(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|w| w.in_flight.load(Ordering::SeqCst))
            .map(|w| w.key().clone())
            .collect()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_worker(
    host: String,
    mut rx: mpsc::Receiver<QueueEntry>,
    executor: Weak<dyn CommandExecutor>,
    cancel: CancellationToken,
    depth: Arc<AtomicUsize>,
    in_flight: Arc<AtomicBool>,
    delay: Duration,
) {
    info!("Command queue worker started for {}", host);

    loop {
        let entry = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            entry = rx.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };
        depth.fetch_sub(1, Ordering::SeqCst);

        if entry.reply_tx.is_closed() {
            trace!("Skipping abandoned command for {}", host);
            continue;
        }

        trace!(
            "Running command for {} after {:?} in queue",
            host,
            entry.enqueued_at.elapsed()
        );

        in_flight.store(true, Ordering::SeqCst);
        let outcome = match executor.upgrade() {
            Some(executor) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PoolError::ConnectionClosed(host.clone())),
                result = executor.execute(&entry.request) => result,
            },
            None => Err(PoolError::ShutDown),
        };
        in_flight.store(false, Ordering::SeqCst);

        let _ = entry.reply_tx.send(outcome);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // Fault everything still queued
    rx.close();
    let mut drained = 0usize;
    while let Ok(entry) = rx.try_recv() {
        depth.fetch_sub(1, Ordering::SeqCst);
        let _ = entry
            .reply_tx
            .send(Err(PoolError::ConnectionClosed(host.clone())));
        drained += 1;
    }

    info!(
        "Command queue worker stopped for {} ({} pending commands faulted)",
        host, drained
    );
}
