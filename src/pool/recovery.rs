//! Failure tracking and passive recovery
//!
//! Hosts whose handshakes fail get a `FailureRecord`. The recovery monitor
//! periodically probes the ones whose backoff has elapsed and forgets them
//! once a probe succeeds.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::registry::ConnectionPool;
use crate::config::RecoveryConfig;

/// Failure bookkeeping for one host
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub count: u32,
    pub first_failure: DateTime<Utc>,
    pub last_failure: DateTime<Utc>,
    pub last_failure_at: Instant,
    pub next_retry: Instant,
    pub last_error: String,
}

/// Serializable view of a failure record
#[derive(Debug, Clone, Serialize)]
pub struct FailureInfo {
    pub host_id: String,
    pub count: u32,
    pub first_failure: DateTime<Utc>,
    pub last_failure: DateTime<Utc>,
    /// Seconds until the host is eligible for a recovery probe (0 = due)
    pub next_retry_in_secs: u64,
    pub last_error: String,
}

/// Per-host failure records
pub struct FailureTracker {
    records: DashMap<String, FailureRecord>,
    backoff_unit: Duration,
    max_backoff: Duration,
}

impl FailureTracker {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            records: DashMap::new(),
            backoff_unit: config.backoff_unit(),
            max_backoff: config.max_backoff(),
        }
    }

    fn backoff_for(&self, count: u32) -> Duration {
        self.backoff_unit.saturating_mul(count).min(self.max_backoff)
    }

    /// Create or bump the host's record. Returns the new failure count.
    pub fn record_failure(&self, host: &str, error: &str) -> u32 {
        let now = Instant::now();
        let wall = Utc::now();

        let mut record = self
            .records
            .entry(host.to_string())
            .or_insert_with(|| FailureRecord {
                count: 0,
                first_failure: wall,
                last_failure: wall,
                last_failure_at: now,
                next_retry: now,
                last_error: String::new(),
            });

        record.count = record.count.saturating_add(1);
        record.last_failure = wall;
        record.last_failure_at = now;
        record.last_error = error.to_string();
        let backoff = self.backoff_for(record.count);
        // 保证单调不减：即使 backoff 已封顶，也不会早于之前的重试时间
        record.next_retry = (now + backoff).max(record.next_retry);

        debug!(
            "Host {} failure #{} recorded, next retry in {:?}: {}",
            host, record.count, backoff, error
        );
        record.count
    }

    pub fn clear(&self, host: &str) -> bool {
        self.records.remove(host).is_some()
    }

    pub fn get(&self, host: &str) -> Option<FailureRecord> {
        self.records.get(host).map(|r| r.value().clone())
    }

    pub fn is_failing(&self, host: &str) -> bool {
        self.records.contains_key(host)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Hosts whose next retry time has passed
    pub fn due_hosts(&self, now: Instant) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.next_retry <= now)
            .map(|r| r.key().clone())
            .collect()
    }

    /// Drop records with no failure for longer than `stale_after`
    pub fn purge_stale(&self, now: Instant, stale_after: Duration) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, r| now.saturating_duration_since(r.last_failure_at) <= stale_after);
        before - self.records.len()
    }

    pub fn snapshot(&self) -> Vec<FailureInfo> {
        let now = Instant::now();
        let mut infos: Vec<FailureInfo> = self
            .records
            .iter()
            .map(|r| FailureInfo {
                host_id: r.key().clone(),
                count: r.count,
                first_failure: r.first_failure,
                last_failure: r.last_failure,
                next_retry_in_secs: r.next_retry.saturating_duration_since(now).as_secs(),
                last_error: r.last_error.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        infos
    }
}

/// Outcome of one recovery pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryPass {
    pub probed: usize,
    pub recovered: usize,
    pub purged: usize,
}

/// Periodic prober for failing hosts
pub struct RecoveryMonitor {
    config: RecoveryConfig,
}

impl RecoveryMonitor {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval()
    }

    /// Probe every due host through the command queue, then purge stale
    /// failure records and expired attempt counters.
    pub async fn run_pass(&self, pool: &ConnectionPool) -> RecoveryPass {
        let tracker = pool.failure_tracker();
        let due = tracker.due_hosts(Instant::now());
        let mut pass = RecoveryPass {
            probed: due.len(),
            ..Default::default()
        };

        if !due.is_empty() {
            info!("Recovery pass probing {} host(s)", due.len());
        }

        let results = join_all(due.iter().map(|host| async move {
            (host, pool.recovery_probe(host).await)
        }))
        .await;

        for (host, result) in results {
            match result {
                Ok(_) => {
                    tracker.clear(host);
                    pass.recovered += 1;
                    info!("Host {} recovered", host);
                }
                Err(e) => {
                    let count = tracker.record_failure(host, &e.to_string());
                    warn!("Recovery probe for {} failed (failure #{}): {}", host, count, e);
                }
            }
        }

        pass.purged = tracker.purge_stale(Instant::now(), self.config.stale_after());
        let expired = pool.purge_expired_attempts();
        if pass.purged > 0 || expired > 0 {
            debug!(
                "Recovery cleanup purged {} failure record(s), {} attempt counter(s)",
                pass.purged, expired
            );
        }

        pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> FailureTracker {
        FailureTracker::new(&RecoveryConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_retry_strictly_increases() {
        let tracker = tracker();
        let mut previous: Option<Instant> = None;
        for expected in 1..=5 {
            assert_eq!(tracker.record_failure("h1", "refused"), expected);
            let next = tracker.get("h1").unwrap().next_retry;
            if let Some(prev) = previous {
                assert!(next > prev);
            }
            previous = Some(next);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_capped() {
        let config = RecoveryConfig {
            backoff_unit_secs: 60,
            max_backoff_secs: 120,
            ..Default::default()
        };
        let tracker = FailureTracker::new(&config);
        for _ in 0..10 {
            tracker.record_failure("h1", "refused");
        }
        let record = tracker.get("h1").unwrap();
        assert_eq!(record.next_retry - record.last_failure_at, Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_hosts_respects_backoff() {
        let tracker = tracker();
        tracker.record_failure("h1", "refused");
        assert!(tracker.due_hosts(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(tracker.due_hosts(Instant::now()), vec!["h1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_stale() {
        let tracker = tracker();
        tracker.record_failure("old", "x");
        tokio::time::advance(Duration::from_secs(25 * 3600)).await;
        tracker.record_failure("new", "y");

        let purged = tracker.purge_stale(Instant::now(), Duration::from_secs(24 * 3600));
        assert_eq!(purged, 1);
        assert!(!tracker.is_failing("old"));
        assert!(tracker.is_failing("new"));
    }
}
