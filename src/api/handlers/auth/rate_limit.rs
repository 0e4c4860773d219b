//! Failed-login throttling.
//!
//! Fixed window per client key: the window opens on the first counted attempt
//! and the client is refused once `max_attempts` attempts land inside it. A
//! success clears the key.
//!
//! Logins reserve their attempt up front with [`RateLimiter::try_acquire`],
//! which checks and increments in one step. Concurrent requests from one
//! client can therefore never evaluate more than `max_attempts` passwords per
//! window.

use anyhow::Context;
use serde::Serialize;
use sqlx::{PgPool, Row};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::Instrument;

use super::StoreFuture;

/// Result of a throttle check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub remaining: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
        }
    }

    fn status(self, attempts: u32) -> RateLimitStatus {
        RateLimitStatus {
            allowed: attempts < self.max_attempts,
            remaining: self.max_attempts.saturating_sub(attempts),
        }
    }

    /// Status after an attempt was reserved; the reserved attempt itself is allowed.
    fn reserved(self, attempts: u32) -> RateLimitStatus {
        RateLimitStatus {
            allowed: true,
            remaining: self.max_attempts.saturating_sub(attempts),
        }
    }

    const fn denied() -> RateLimitStatus {
        RateLimitStatus {
            allowed: false,
            remaining: 0,
        }
    }
}

pub trait RateLimiter: Send + Sync {
    /// Whether `key` may attempt a login right now.
    fn check<'a>(&'a self, key: &'a str) -> StoreFuture<'a, RateLimitStatus>;

    /// Reserve one attempt for `key` if its budget allows it.
    ///
    /// Check and increment are one atomic step. A denied status leaves the
    /// counter untouched; an allowed one reports the attempts left after this one.
    fn try_acquire<'a>(&'a self, key: &'a str) -> StoreFuture<'a, RateLimitStatus>;

    /// Give back an attempt reserved by `try_acquire` that was never evaluated.
    fn release<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    /// Count one failed attempt and return the updated status.
    fn record_failure<'a>(&'a self, key: &'a str) -> StoreFuture<'a, RateLimitStatus>;

    /// Clear the counter for `key`.
    fn record_success<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    /// Drop counters whose window has elapsed. Returns how many were removed.
    fn purge_expired(&self) -> StoreFuture<'_, u64>;

    /// Attempts left before `key` is locked out.
    fn remaining<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u32> {
        Box::pin(async move { Ok(self.check(key).await?.remaining) })
    }
}

/// Time source for the in-memory limiter.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Clone, Copy, Debug)]
struct Counter {
    attempts: u32,
    window_start: Instant,
}

/// Single-process limiter keeping counters in a mutex-guarded map.
pub struct MemoryRateLimiter {
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
    counters: Mutex<HashMap<String, Counter>>,
}

impl MemoryRateLimiter {
    #[must_use]
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn expired(&self, counter: &Counter, now: Instant) -> bool {
        now.saturating_duration_since(counter.window_start) >= self.policy.window
    }
}

impl RateLimiter for MemoryRateLimiter {
    fn check<'a>(&'a self, key: &'a str) -> StoreFuture<'a, RateLimitStatus> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut counters = self.counters.lock().await;
            let attempts = match counters.get(key) {
                Some(counter) if self.expired(counter, now) => {
                    counters.remove(key);
                    0
                }
                Some(counter) => counter.attempts,
                None => 0,
            };
            Ok(self.policy.status(attempts))
        })
    }

    fn try_acquire<'a>(&'a self, key: &'a str) -> StoreFuture<'a, RateLimitStatus> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut counters = self.counters.lock().await;
            counters.retain(|_, counter| !self.expired(counter, now));
            let attempts = counters.get(key).map_or(0, |counter| counter.attempts);
            if attempts >= self.policy.max_attempts {
                return Ok(RateLimitPolicy::denied());
            }
            let counter = counters.entry(key.to_string()).or_insert(Counter {
                attempts: 0,
                window_start: now,
            });
            counter.attempts += 1;
            Ok(self.policy.reserved(counter.attempts))
        })
    }

    fn release<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut counters = self.counters.lock().await;
            let emptied = match counters.get_mut(key) {
                Some(counter) => {
                    counter.attempts = counter.attempts.saturating_sub(1);
                    counter.attempts == 0
                }
                None => false,
            };
            if emptied {
                counters.remove(key);
            }
            Ok(())
        })
    }

    fn record_failure<'a>(&'a self, key: &'a str) -> StoreFuture<'a, RateLimitStatus> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut counters = self.counters.lock().await;
            counters.retain(|_, counter| !self.expired(counter, now));
            let counter = counters.entry(key.to_string()).or_insert(Counter {
                attempts: 0,
                window_start: now,
            });
            counter.attempts = counter.attempts.saturating_add(1);
            Ok(self.policy.status(counter.attempts))
        })
    }

    fn record_success<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.counters.lock().await.remove(key);
            Ok(())
        })
    }

    fn purge_expired(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut counters = self.counters.lock().await;
            let before = counters.len();
            counters.retain(|_, counter| !self.expired(counter, now));
            Ok(u64::try_from(before - counters.len()).unwrap_or(u64::MAX))
        })
    }
}

/// `PostgreSQL` limiter over the `login_attempts` table.
#[derive(Clone, Debug)]
pub struct PgRateLimiter {
    pool: PgPool,
    policy: RateLimitPolicy,
}

impl PgRateLimiter {
    #[must_use]
    pub fn new(pool: PgPool, policy: RateLimitPolicy) -> Self {
        Self { pool, policy }
    }

    fn window_seconds(&self) -> i64 {
        i64::try_from(self.policy.window.as_secs()).unwrap_or(i64::MAX)
    }

    fn max_attempts(&self) -> i32 {
        i32::try_from(self.policy.max_attempts).unwrap_or(i32::MAX)
    }
}

fn attempts_from_db(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

impl RateLimiter for PgRateLimiter {
    fn check<'a>(&'a self, key: &'a str) -> StoreFuture<'a, RateLimitStatus> {
        Box::pin(async move {
            let query = r"
                SELECT attempt_count
                FROM login_attempts
                WHERE client_key = $1
                  AND window_start > NOW() - ($2 * INTERVAL '1 second')
            ";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.statement = query
            );
            let row = sqlx::query(query)
                .bind(key)
                .bind(self.window_seconds())
                .fetch_optional(&self.pool)
                .instrument(span)
                .await
                .context("failed to read login attempts")?;
            let attempts = match row {
                Some(row) => attempts_from_db(
                    row.try_get("attempt_count")
                        .context("failed to decode attempt_count")?,
                ),
                None => 0,
            };
            Ok(self.policy.status(attempts))
        })
    }

    fn try_acquire<'a>(&'a self, key: &'a str) -> StoreFuture<'a, RateLimitStatus> {
        Box::pin(async move {
            if self.policy.max_attempts == 0 {
                return Ok(RateLimitPolicy::denied());
            }
            // The conflicting row is locked by the upsert, so the WHERE guard and the
            // increment see the same count. No row back means the budget is spent.
            let query = r"
                INSERT INTO login_attempts (client_key, attempt_count, window_start)
                VALUES ($1, 1, NOW())
                ON CONFLICT (client_key) DO UPDATE SET
                    attempt_count = CASE
                        WHEN login_attempts.window_start <= NOW() - ($2 * INTERVAL '1 second') THEN 1
                        ELSE login_attempts.attempt_count + 1
                    END,
                    window_start = CASE
                        WHEN login_attempts.window_start <= NOW() - ($2 * INTERVAL '1 second') THEN NOW()
                        ELSE login_attempts.window_start
                    END
                WHERE login_attempts.window_start <= NOW() - ($2 * INTERVAL '1 second')
                   OR login_attempts.attempt_count < $3
                RETURNING attempt_count
            ";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPSERT",
                db.statement = query
            );
            let row = sqlx::query(query)
                .bind(key)
                .bind(self.window_seconds())
                .bind(self.max_attempts())
                .fetch_optional(&self.pool)
                .instrument(span)
                .await
                .context("failed to reserve login attempt")?;
            match row {
                Some(row) => {
                    let attempts: i32 = row
                        .try_get("attempt_count")
                        .context("failed to decode attempt_count")?;
                    Ok(self.policy.reserved(attempts_from_db(attempts)))
                }
                None => Ok(RateLimitPolicy::denied()),
            }
        })
    }

    fn release<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let query = r"
                UPDATE login_attempts
                SET attempt_count = attempt_count - 1
                WHERE client_key = $1
                  AND attempt_count > 0
            ";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(key)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to release login attempt")?;
            Ok(())
        })
    }

    fn record_failure<'a>(&'a self, key: &'a str) -> StoreFuture<'a, RateLimitStatus> {
        Box::pin(async move {
            // One statement so concurrent failures from the same client cannot lose updates.
            let query = r"
                INSERT INTO login_attempts (client_key, attempt_count, window_start)
                VALUES ($1, 1, NOW())
                ON CONFLICT (client_key) DO UPDATE SET
                    attempt_count = CASE
                        WHEN login_attempts.window_start <= NOW() - ($2 * INTERVAL '1 second') THEN 1
                        ELSE login_attempts.attempt_count + 1
                    END,
                    window_start = CASE
                        WHEN login_attempts.window_start <= NOW() - ($2 * INTERVAL '1 second') THEN NOW()
                        ELSE login_attempts.window_start
                    END
                RETURNING attempt_count
            ";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPSERT",
                db.statement = query
            );
            let row = sqlx::query(query)
                .bind(key)
                .bind(self.window_seconds())
                .fetch_one(&self.pool)
                .instrument(span)
                .await
                .context("failed to record login failure")?;
            let attempts: i32 = row
                .try_get("attempt_count")
                .context("failed to decode attempt_count")?;
            Ok(self.policy.status(attempts_from_db(attempts)))
        })
    }

    fn record_success<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let query = "DELETE FROM login_attempts WHERE client_key = $1";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "DELETE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(key)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to clear login attempts")?;
            Ok(())
        })
    }

    fn purge_expired(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let query = r"
                DELETE FROM login_attempts
                WHERE window_start <= NOW() - ($1 * INTERVAL '1 second')
            ";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "DELETE",
                db.statement = query
            );
            let result = sqlx::query(query)
                .bind(self.window_seconds())
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to purge expired login attempts")?;
            Ok(result.rows_affected())
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Clock that only moves when told to.
    pub(crate) struct ManualClock {
        base: Instant,
        offset_secs: AtomicU64,
    }

    impl ManualClock {
        pub(crate) fn new() -> Self {
            Self {
                base: Instant::now(),
                offset_secs: AtomicU64::new(0),
            }
        }

        pub(crate) fn advance(&self, by: Duration) {
            self.offset_secs.fetch_add(by.as_secs(), Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + Duration::from_secs(self.offset_secs.load(Ordering::SeqCst))
        }
    }

    fn limiter(clock: Arc<ManualClock>) -> MemoryRateLimiter {
        MemoryRateLimiter::with_clock(RateLimitPolicy::new(3, Duration::from_secs(60)), clock)
    }

    #[tokio::test]
    async fn fresh_key_is_allowed_with_full_budget() -> Result<()> {
        let limiter = limiter(Arc::new(ManualClock::new()));
        let status = limiter.check("10.0.0.1").await?;
        assert_eq!(
            status,
            RateLimitStatus {
                allowed: true,
                remaining: 3
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn locks_after_max_failures() -> Result<()> {
        let limiter = limiter(Arc::new(ManualClock::new()));
        assert_eq!(limiter.record_failure("10.0.0.1").await?.remaining, 2);
        assert_eq!(limiter.record_failure("10.0.0.1").await?.remaining, 1);
        let status = limiter.record_failure("10.0.0.1").await?;
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
        assert!(!limiter.check("10.0.0.1").await?.allowed);
        assert_eq!(limiter.remaining("10.0.0.1").await?, 0);

        // Other clients are unaffected.
        assert!(limiter.check("10.0.0.2").await?.allowed);
        Ok(())
    }

    #[tokio::test]
    async fn window_expiry_resets_counter() -> Result<()> {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(clock.clone());
        for _ in 0..3 {
            limiter.record_failure("10.0.0.1").await?;
        }
        clock.advance(Duration::from_secs(59));
        assert!(!limiter.check("10.0.0.1").await?.allowed);

        clock.advance(Duration::from_secs(1));
        let status = limiter.check("10.0.0.1").await?;
        assert!(status.allowed);
        assert_eq!(status.remaining, 3);

        // A new failure opens a new window.
        assert_eq!(limiter.record_failure("10.0.0.1").await?.remaining, 2);
        Ok(())
    }

    #[tokio::test]
    async fn success_clears_counter() -> Result<()> {
        let limiter = limiter(Arc::new(ManualClock::new()));
        limiter.record_failure("10.0.0.1").await?;
        limiter.record_failure("10.0.0.1").await?;
        limiter.record_success("10.0.0.1").await?;
        assert_eq!(limiter.remaining("10.0.0.1").await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_failures_are_all_counted() -> Result<()> {
        let limiter = Arc::new(MemoryRateLimiter::new(RateLimitPolicy::new(
            100,
            Duration::from_secs(60),
        )));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.record_failure("10.0.0.9").await
            }));
        }
        for handle in handles {
            handle.await??;
        }
        assert_eq!(limiter.remaining("10.0.0.9").await?, 80);
        Ok(())
    }

    #[tokio::test]
    async fn try_acquire_reserves_until_budget_is_spent() -> Result<()> {
        let limiter = limiter(Arc::new(ManualClock::new()));
        assert_eq!(
            limiter.try_acquire("10.0.0.1").await?,
            RateLimitStatus {
                allowed: true,
                remaining: 2
            }
        );
        assert_eq!(limiter.try_acquire("10.0.0.1").await?.remaining, 1);
        assert_eq!(
            limiter.try_acquire("10.0.0.1").await?,
            RateLimitStatus {
                allowed: true,
                remaining: 0
            }
        );
        assert_eq!(
            limiter.try_acquire("10.0.0.1").await?,
            RateLimitStatus {
                allowed: false,
                remaining: 0
            }
        );
        assert!(!limiter.check("10.0.0.1").await?.allowed);
        Ok(())
    }

    #[tokio::test]
    async fn release_returns_an_unused_reservation() -> Result<()> {
        let limiter = limiter(Arc::new(ManualClock::new()));
        limiter.try_acquire("10.0.0.1").await?;
        limiter.try_acquire("10.0.0.1").await?;
        limiter.release("10.0.0.1").await?;
        assert_eq!(limiter.remaining("10.0.0.1").await?, 2);

        limiter.release("10.0.0.1").await?;
        limiter.release("10.0.0.1").await?;
        assert_eq!(limiter.remaining("10.0.0.1").await?, 3);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_never_exceed_budget() -> Result<()> {
        let limiter = Arc::new(MemoryRateLimiter::new(RateLimitPolicy::new(
            3,
            Duration::from_secs(60),
        )));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.try_acquire("10.0.0.9").await
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await??.allowed {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        Ok(())
    }

    #[tokio::test]
    async fn purge_drops_only_elapsed_windows() -> Result<()> {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(clock.clone());
        limiter.record_failure("10.0.0.1").await?;
        clock.advance(Duration::from_secs(30));
        limiter.record_failure("10.0.0.2").await?;
        clock.advance(Duration::from_secs(30));

        assert_eq!(limiter.purge_expired().await?, 1);
        assert_eq!(limiter.remaining("10.0.0.2").await?, 2);
        assert_eq!(limiter.purge_expired().await?, 0);
        Ok(())
    }
}
