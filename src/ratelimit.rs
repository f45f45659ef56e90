//! Fixed-window request counter per source identifier
//!
//! Windows are aligned buckets (`floor(now / window)`), not sliding windows
//! reset on each hit. The get-then-increment pair is not atomic, so
//! concurrent requests from one source can overshoot the threshold by a few.
//! This is an advisory defense, not a security boundary.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::ServiceSettings;
use crate::error::Result;
use crate::store::{bounded, CounterStore};

/// Identifier the edge reports when it has no client address
pub const UNKNOWN_IDENTIFIER: &str = "unknown";

/// Identifiers that bypass the windowed gates
pub fn is_unknown_identifier(identifier: &str) -> bool {
    let trimmed = identifier.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNKNOWN_IDENTIFIER)
}

pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    threshold: u64,
    window: Duration,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        threshold: u64,
        window: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            counters,
            clock,
            threshold,
            window: window.max(Duration::from_secs(1)),
            timeout,
        }
    }

    pub fn from_settings(
        counters: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        settings: &ServiceSettings,
    ) -> Self {
        Self::new(
            counters,
            clock,
            settings.rate_limit_threshold,
            settings.rate_window(),
            settings.store_timeout(),
        )
    }

    /// Bucket index for the current time
    pub fn current_bucket(&self) -> i64 {
        self.clock
            .now()
            .timestamp()
            .div_euclid(self.window.as_secs() as i64)
    }

    pub fn counter_key(identifier: &str, bucket: i64) -> String {
        format!("ratelimit:{}:{}", identifier.trim(), bucket)
    }

    /// Strict check: store failures and timeouts are returned to the caller
    pub async fn check(&self, identifier: &str) -> Result<bool> {
        if is_unknown_identifier(identifier) {
            return Ok(false);
        }

        let key = Self::counter_key(identifier, self.current_bucket());
        let count = bounded(self.timeout, self.counters.get(&key)).await?;
        if count >= self.threshold {
            debug!(identifier, count, "rate limited");
            return Ok(true);
        }

        bounded(self.timeout, self.counters.increment(&key, self.window)).await?;
        Ok(false)
    }

    /// Fail-open check: any store failure counts as not limited
    pub async fn is_limited(&self, identifier: &str) -> bool {
        match self.check(identifier).await {
            Ok(limited) => limited,
            Err(e) => {
                warn!(identifier, error = %e, "rate limit check failed, allowing");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::TrackingError;
    use crate::store::MemoryCounterStore;
    use async_trait::async_trait;

    const HOUR: Duration = Duration::from_secs(3600);

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        let counters = Arc::new(MemoryCounterStore::new(clock.clone()));
        RateLimiter::new(counters, clock, 100, HOUR, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_threshold_then_next_bucket() {
        // Start at the top of an hour so every call lands in one bucket
        let clock = Arc::new(ManualClock::at_epoch(1_700_002_800));
        let limiter = limiter(clock.clone());

        for i in 0..100 {
            assert!(!limiter.is_limited("1.2.3.4").await, "call {} limited", i);
        }
        assert!(limiter.is_limited("1.2.3.4").await);
        assert!(limiter.is_limited("1.2.3.4").await);
        assert!(!limiter.is_limited("5.6.7.8").await);

        clock.advance(HOUR);
        assert!(!limiter.is_limited("1.2.3.4").await);
    }

    #[tokio::test]
    async fn test_buckets_are_aligned_not_sliding() {
        let clock = Arc::new(ManualClock::at_epoch(1_700_002_800 + 3599));
        let limiter = limiter(clock.clone());
        for _ in 0..100 {
            limiter.is_limited("1.2.3.4").await;
        }
        assert!(limiter.is_limited("1.2.3.4").await);

        clock.advance(Duration::from_secs(1));
        assert!(!limiter.is_limited("1.2.3.4").await);
    }

    #[tokio::test]
    async fn test_unknown_identifier_bypasses() {
        let clock = Arc::new(ManualClock::at_epoch(0));
        let counters = Arc::new(MemoryCounterStore::new(clock.clone()));
        let limiter = RateLimiter::new(counters, clock, 0, HOUR, Duration::from_secs(1));
        assert!(!limiter.is_limited("").await);
        assert!(!limiter.is_limited("unknown").await);
        assert!(limiter.is_limited("1.2.3.4").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_overshoot_is_bounded() -> Result<()> {
        const THRESHOLD: u64 = 10;
        const CALLS: usize = 50;

        let clock = Arc::new(ManualClock::at_epoch(1_700_002_800));
        let counters = Arc::new(MemoryCounterStore::new(clock.clone()));
        let limiter = Arc::new(RateLimiter::new(
            counters.clone(),
            clock,
            THRESHOLD,
            HOUR,
            Duration::from_secs(1),
        ));

        let handles: Vec<_> = (0..CALLS)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.is_limited("1.2.3.4").await })
            })
            .collect();
        let mut allowed = 0;
        for handle in handles {
            if !handle.await.expect("task panicked") {
                allowed += 1;
            }
        }

        // Racing callers may all pass the read before any increment lands,
        // but the threshold is always reachable
        assert!(allowed >= THRESHOLD as usize, "only {} allowed", allowed);
        assert!(allowed <= THRESHOLD as usize + CALLS, "{} allowed", allowed);
        let key = RateLimiter::counter_key("1.2.3.4", limiter.current_bucket());
        assert_eq!(counters.get(&key).await?, allowed as u64);

        // Once the burst is over the limit holds
        assert!(limiter.is_limited("1.2.3.4").await);
        Ok(())
    }

    struct BrokenCounters;

    #[async_trait]
    impl CounterStore for BrokenCounters {
        async fn get(&self, _key: &str) -> Result<u64> {
            Err(TrackingError::Storage("kv unreachable".into()))
        }
        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64> {
            Err(TrackingError::Storage("kv unreachable".into()))
        }
    }

    struct StalledCounters;

    #[async_trait]
    impl CounterStore for StalledCounters {
        async fn get(&self, _key: &str) -> Result<u64> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(u64::MAX)
        }
        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_store_error_fails_open() {
        let clock = Arc::new(ManualClock::at_epoch(0));
        let limiter = RateLimiter::new(Arc::new(BrokenCounters), clock, 0, HOUR, HOUR);
        assert!(limiter.check("1.2.3.4").await.is_err());
        assert!(!limiter.is_limited("1.2.3.4").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_fails_open() {
        let clock = Arc::new(ManualClock::at_epoch(0));
        let limiter = RateLimiter::new(
            Arc::new(StalledCounters),
            clock,
            1,
            HOUR,
            Duration::from_millis(50),
        );
        assert!(matches!(
            limiter.check("1.2.3.4").await,
            Err(TrackingError::StorageTimeout(_))
        ));
        assert!(!limiter.is_limited("1.2.3.4").await);
    }
}
