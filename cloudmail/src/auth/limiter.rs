//! Login attempt limiting
//!
//! Failed logins are counted per identifier, `"{username}@{client_ip}"`. Reaching the
//! maximum locks the identifier for the configured lock time. State is process-local and
//! starts empty on every restart.
//!
//! # Example
//! ```no_run
//! use cloudmail::auth::LoginLimiter;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let limiter = LoginLimiter::new(5, Duration::from_secs(600));
//! let id = LoginLimiter::identifier("admin", "192.0.2.1");
//!
//! if limiter.is_locked(&id).await.locked {
//!     println!("Too many failed logins");
//! }
//! # }
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LoginLimiterConfig;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Result of recording a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptOutcome {
    pub locked: bool,
    pub remaining_attempts: u32,
    /// Milliseconds until the lock ends, 0 when not locked
    pub lock_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    pub locked: bool,
    pub remaining: Duration,
}

impl LockStatus {
    /// Remaining lock time in whole minutes, rounded up
    pub fn remaining_minutes(&self) -> u64 {
        (self.remaining.as_secs() + 59) / 60
    }
}

#[derive(Debug, Clone)]
struct AttemptRecord {
    attempts: u32,
    lock_until: Option<Instant>,
    last_attempt: Instant,
}

impl AttemptRecord {
    fn lock_remaining(&self, now: Instant) -> Option<Duration> {
        self.lock_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    fn is_expired(&self, now: Instant, lock_time: Duration) -> bool {
        match self.lock_until {
            Some(until) => until <= now,
            None => now.duration_since(self.last_attempt) > lock_time,
        }
    }
}

#[derive(Clone)]
pub struct LoginLimiter {
    records: Arc<RwLock<HashMap<String, AttemptRecord>>>,
    max_attempts: u32,
    lock_time: Duration,
}

impl LoginLimiter {
    pub fn new(max_attempts: u32, lock_time: Duration) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            max_attempts: max_attempts.max(1),
            lock_time,
        }
    }

    pub fn from_config(config: &LoginLimiterConfig) -> Self {
        Self::new(config.max_attempts, config.lock_time())
    }

    pub fn identifier(username: &str, client_ip: &str) -> String {
        format!("{}@{}", username.trim().to_lowercase(), client_ip)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether `id` is locked out. Expired records are dropped on the way.
    pub async fn is_locked(&self, id: &str) -> LockStatus {
        let now = Instant::now();
        let mut records = self.records.write().await;

        let Some(record) = records.get(id) else {
            return LockStatus {
                locked: false,
                remaining: Duration::ZERO,
            };
        };

        match record.lock_remaining(now) {
            Some(remaining) => LockStatus {
                locked: true,
                remaining,
            },
            None => {
                if record.lock_until.is_some() {
                    records.remove(id);
                }
                LockStatus {
                    locked: false,
                    remaining: Duration::ZERO,
                }
            }
        }
    }

    pub async fn record_failed_attempt(&self, id: &str) -> AttemptOutcome {
        let now = Instant::now();
        let mut records = self.records.write().await;

        let record = records.entry(id.to_string()).or_insert(AttemptRecord {
            attempts: 0,
            lock_until: None,
            last_attempt: now,
        });

        if let Some(remaining) = record.lock_remaining(now) {
            return AttemptOutcome {
                locked: true,
                remaining_attempts: 0,
                lock_time: remaining.as_millis() as u64,
            };
        }
        if record.lock_until.is_some() {
            // Lock ran out; start counting again
            record.attempts = 0;
            record.lock_until = None;
        }

        record.attempts += 1;
        record.last_attempt = now;

        if record.attempts >= self.max_attempts {
            record.lock_until = Some(now + self.lock_time);
            warn!(
                "Login locked for {} after {} failed attempts",
                id, record.attempts
            );
            return AttemptOutcome {
                locked: true,
                remaining_attempts: 0,
                lock_time: self.lock_time.as_millis() as u64,
            };
        }

        debug!("Failed login {} for {}", record.attempts, id);
        AttemptOutcome {
            locked: false,
            remaining_attempts: self.max_attempts - record.attempts,
            lock_time: 0,
        }
    }

    pub async fn reset_attempts(&self, id: &str) {
        self.records.write().await.remove(id);
    }

    /// Drop expired locks and stale counters; returns how many were removed
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now, self.lock_time));
        before - records.len()
    }

    /// Sweep every hour until `shutdown` fires
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Login limiter sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let removed = limiter.sweep().await;
                        if removed > 0 {
                            debug!("Swept {} login limiter records", removed);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_locks_after_max_attempts() {
        let limiter = LoginLimiter::new(5, Duration::from_secs(600));
        let id = LoginLimiter::identifier("admin", "10.0.0.1");

        for expected in (1..5).rev() {
            let outcome = limiter.record_failed_attempt(&id).await;
            assert!(!outcome.locked);
            assert_eq!(outcome.remaining_attempts, expected);
        }

        let outcome = limiter.record_failed_attempt(&id).await;
        assert!(outcome.locked);
        assert_eq!(outcome.lock_time, 600_000);

        let status = limiter.is_locked(&id).await;
        assert!(status.locked);
        assert_eq!(status.remaining_minutes(), 10);

        let again = limiter.record_failed_attempt(&id).await;
        assert!(again.locked);
        assert_eq!(again.remaining_attempts, 0);
        assert!(again.lock_time <= 600_000);
    }

    #[tokio::test]
    async fn test_reset_clears_attempts() {
        let limiter = LoginLimiter::new(2, Duration::from_secs(600));
        let id = LoginLimiter::identifier("user", "10.0.0.2");

        limiter.record_failed_attempt(&id).await;
        limiter.record_failed_attempt(&id).await;
        assert!(limiter.is_locked(&id).await.locked);

        limiter.reset_attempts(&id).await;
        assert!(!limiter.is_locked(&id).await.locked);
        assert_eq!(limiter.record_failed_attempt(&id).await.remaining_attempts, 1);
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let limiter = LoginLimiter::new(1, Duration::from_secs(600));
        limiter
            .record_failed_attempt(&LoginLimiter::identifier("a", "1.1.1.1"))
            .await;

        assert!(limiter.is_locked(&LoginLimiter::identifier("a", "1.1.1.1")).await.locked);
        assert!(!limiter.is_locked(&LoginLimiter::identifier("a", "2.2.2.2")).await.locked);
    }

    #[tokio::test]
    async fn test_expired_lock_is_released() {
        let limiter = LoginLimiter::new(1, Duration::from_millis(20));
        let id = LoginLimiter::identifier("a", "1.1.1.1");

        assert!(limiter.record_failed_attempt(&id).await.locked);
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!limiter.is_locked(&id).await.locked);
        assert_eq!(limiter.sweep().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let limiter = LoginLimiter::new(3, Duration::from_millis(20));
        limiter.record_failed_attempt("a@1.1.1.1").await;
        limiter.record_failed_attempt("b@1.1.1.1").await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(limiter.sweep().await, 2);
    }
}
