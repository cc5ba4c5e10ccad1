//! Token-bucket rate limiter guarding outbound registry calls.
//!
//! The bucket state lives in a [`RowStore`] row rather than in process
//! memory, so every worker sharing the store draws from the same bucket;
//! with [`RateLimiter::sqlite`] that includes workers in other processes.
//! Refill is computed lazily from the stored `last_refill` stamp on each
//! access; there is no background ticker.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::store::{LIMITER_TABLE, MemoryStore, RowStore, SqliteStore};
use crate::telemetry;
use crate::{CedulaError, Result};

/// First poll interval of [`RateLimiter::acquire`].
const POLL_INITIAL: Duration = Duration::from_millis(100);
/// Poll interval ceiling of [`RateLimiter::acquire`].
const POLL_MAX: Duration = Duration::from_secs(2);

/// Bucket parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Burst ceiling. Default: 20.
    pub capacity: f64,
    /// Tokens credited per second. Default: 10.
    pub refill_rate: f64,
    /// Store key of the bucket row. Default: `registry_api`.
    pub key: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20.0,
            refill_rate: 10.0,
            key: "registry_api".to_string(),
        }
    }
}

/// Persisted bucket row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: DateTime<Utc>,
    pub total_requests: u64,
    pub last_request: Option<DateTime<Utc>>,
}

impl BucketState {
    fn full(capacity: f64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            total_requests: 0,
            last_request: None,
        }
    }

    /// Credit tokens for the time elapsed since `last_refill`.
    ///
    /// Idempotent for a given `now`: the stamp moves forward, so a second
    /// call at the same instant credits nothing. A clock that moved
    /// backwards credits nothing either.
    fn refill(&mut self, now: DateTime<Utc>, capacity: f64, rate: f64) {
        let elapsed = (now - self.last_refill).num_microseconds().unwrap_or(i64::MAX);
        if elapsed > 0 {
            let credit = elapsed as f64 / 1_000_000.0 * rate;
            self.tokens = (self.tokens + credit).min(capacity);
            self.last_refill = now;
        }
    }
}

/// Point-in-time view of the bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    /// Available tokens, rounded to two decimals.
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    pub total_requests: u64,
    pub last_request: Option<DateTime<Utc>>,
    /// `(capacity - tokens) / capacity * 100`, rounded to two decimals.
    pub utilization: f64,
}

/// Shared token bucket.
///
/// Cheap to clone; clones share the same backing store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RowStore<String, BucketState>>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RowStore<String, BucketState>>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// A limiter whose bucket lives in a fresh [`MemoryStore`].
    pub fn in_memory(clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self::new(Arc::new(MemoryStore::<String, BucketState>::new()), clock, config)
    }

    /// A limiter whose bucket lives in the shared SQLite database at `path`.
    ///
    /// Every limiter opened on the same file with the same key draws from
    /// one bucket, across processes.
    pub fn sqlite(path: &Path, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Result<Self> {
        let store = SqliteStore::<String, BucketState>::open(path, LIMITER_TABLE)?;
        Ok(Self::new(Arc::new(store), clock, config))
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take one token if available. Never blocks and never fails.
    ///
    /// On refusal the refilled state is still persisted. A storage failure
    /// is logged and reported as refusal.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let capacity = self.config.capacity;
        let rate = self.config.refill_rate;
        let mut granted = false;

        let result = self.store.upsert_with(&self.config.key, &mut |current| {
            let mut state = current.unwrap_or_else(|| BucketState::full(capacity, now));
            state.refill(now, capacity, rate);
            granted = state.tokens >= 1.0;
            if granted {
                state.tokens -= 1.0;
                state.total_requests += 1;
                state.last_request = Some(now);
            }
            Some(state)
        });

        match result {
            Ok(_) if granted => true,
            Ok(_) => {
                metrics::counter!(telemetry::RATE_LIMITED_TOTAL).increment(1);
                debug!(key = %self.config.key, "rate limiter token refused");
                false
            }
            Err(e) => {
                warn!(key = %self.config.key, error = %e, "rate limiter storage failure");
                false
            }
        }
    }

    /// Wait for a token, polling with backoff, up to `timeout`.
    ///
    /// A zero timeout makes a single attempt. A timeout too large to add to
    /// the current instant (e.g. `Duration::MAX`) waits without a deadline.
    /// Poll intervals start at 100ms and double up to 2s, never sleeping
    /// past the deadline.
    pub async fn acquire(&self, timeout: Duration) -> Result<()> {
        if self.try_acquire() {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now().checked_add(timeout);
        let mut interval = POLL_INITIAL;
        loop {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(tokio::time::Instant::now()),
                None => POLL_MAX,
            };
            if remaining.is_zero() {
                return Err(CedulaError::RateLimitExceeded(format!(
                    "no token available for '{}' within {:.1}s; retry later",
                    self.config.key,
                    timeout.as_secs_f64()
                )));
            }
            tokio::time::sleep(interval.min(remaining)).await;
            if self.try_acquire() {
                return Ok(());
            }
            interval = (interval * 2).min(POLL_MAX);
        }
    }

    /// Current bucket state after a lazy refill. Does not consume a token.
    pub fn available_tokens(&self) -> Result<BucketSnapshot> {
        let now = self.clock.now();
        let capacity = self.config.capacity;
        let rate = self.config.refill_rate;

        let state = self
            .store
            .upsert_with(&self.config.key, &mut |current| {
                let mut state = current.unwrap_or_else(|| BucketState::full(capacity, now));
                state.refill(now, capacity, rate);
                Some(state)
            })?
            .unwrap_or_else(|| BucketState::full(capacity, now));

        let utilization = if capacity > 0.0 {
            (capacity - state.tokens) / capacity * 100.0
        } else {
            0.0
        };
        Ok(BucketSnapshot {
            tokens: round2(state.tokens),
            capacity,
            refill_rate: rate,
            total_requests: state.total_requests,
            last_request: state.last_request,
            utilization: round2(utilization),
        })
    }

    /// Restore full capacity and zero the counters.
    pub fn reset(&self) -> Result<()> {
        let fresh = BucketState::full(self.config.capacity, self.clock.now());
        self.store
            .upsert_with(&self.config.key, &mut |_| Some(fresh.clone()))?;
        debug!(key = %self.config.key, "rate limiter reset");
        Ok(())
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn refill_is_idempotent_at_same_instant() {
        let now = Utc::now();
        let mut state = BucketState {
            tokens: 0.0,
            last_refill: now - ChronoDuration::milliseconds(500),
            total_requests: 0,
            last_request: None,
        };
        state.refill(now, 20.0, 10.0);
        assert!((state.tokens - 5.0).abs() < 1e-9);
        state.refill(now, 20.0, 10.0);
        assert!((state.tokens - 5.0).abs() < 1e-9);
    }

    #[test]
    fn refill_caps_at_capacity() {
        let now = Utc::now();
        let mut state = BucketState {
            tokens: 3.0,
            last_refill: now - ChronoDuration::days(2),
            total_requests: 0,
            last_request: None,
        };
        state.refill(now, 20.0, 10.0);
        assert_eq!(state.tokens, 20.0);
    }

    #[test]
    fn refill_ignores_clock_going_backwards() {
        let now = Utc::now();
        let mut state = BucketState {
            tokens: 2.0,
            last_refill: now + ChronoDuration::seconds(5),
            total_requests: 0,
            last_request: None,
        };
        state.refill(now, 20.0, 10.0);
        assert_eq!(state.tokens, 2.0);
    }

    #[test]
    fn round2_rounds() {
        assert_eq!(round2(1.23456), 1.23);
        assert_eq!(round2(99.999), 100.0);
    }
}
