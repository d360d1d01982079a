//! Token bucket rate limiter.
//!
//! Each `(identity, endpoint)` pair gets its own bucket, created full on first
//! use. Buckets refill continuously at `limit / window` tokens per second;
//! refill is computed lazily on access rather than by a timer. A request of
//! cost `n` is admitted when at least `n` tokens are available.
//!
//! State lives only in this process. The bucket map is a [`DashMap`] whose
//! shard locks are held just long enough to find or insert a bucket; the
//! refill-and-debit step runs under a mutex owned by that one bucket, so
//! unrelated keys never contend.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::backend::RateLimiterBackend;
use super::request::RateLimitRequest;
use super::result::{DecisionReason, RateLimitResult};
use crate::time::TimeSource;

/// Identifies one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub identity: String,
    pub endpoint: String,
}

impl BucketKey {
    pub fn new(identity: &str, endpoint: &str) -> Self {
        Self {
            identity: identity.to_string(),
            endpoint: endpoint.to_string(),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.identity, self.endpoint)
    }
}

/// Mutable state of a single bucket.
#[derive(Debug)]
struct BucketState {
    /// Always within `[0, capacity]`
    tokens: f64,
    last_refill: DateTime<Utc>,
    /// Parameters of the most recent check, used by the sweeper.
    capacity: f64,
    refill_rate: f64,
    /// Set when the sweeper drops this bucket from the map. A caller that
    /// raced the sweeper must look the bucket up again.
    evicted: bool,
}

impl BucketState {
    fn new(capacity: f64, refill_rate: f64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            capacity,
            refill_rate,
            evicted: false,
        }
    }

    fn refill(&mut self, now: DateTime<Utc>, capacity: f64, refill_rate: f64) {
        self.capacity = capacity;
        self.refill_rate = refill_rate;
        let elapsed = elapsed_secs(self.last_refill, now);
        if elapsed > 0.0 {
            if refill_rate > 0.0 {
                self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
            }
            self.last_refill = now;
        }
        // A policy may have shrunk since the bucket was created.
        self.tokens = self.tokens.clamp(0.0, capacity);
    }

    /// Whether a lazy refill at `now` would bring the bucket back to capacity.
    fn is_full_at(&self, now: DateTime<Utc>) -> bool {
        let elapsed = elapsed_secs(self.last_refill, now).max(0.0);
        self.tokens + elapsed * self.refill_rate >= self.capacity
    }
}

fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_nanoseconds() {
        Some(nanos) => nanos as f64 / 1_000_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

/// In-memory token bucket limiter.
pub struct TokenBucketLimiter {
    buckets: DashMap<BucketKey, Arc<Mutex<BucketState>>>,
    clock: Arc<dyn TimeSource>,
}

impl TokenBucketLimiter {
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
        }
    }

    /// Refill, then try to debit `request.cost()` tokens.
    ///
    /// Never blocks beyond the bucket's own critical section and never fails.
    pub fn try_acquire(&self, request: &RateLimitRequest) -> RateLimitResult {
        let now = self.clock.now();
        let capacity = f64::from(request.limit());
        let refill_rate = capacity / f64::from(request.window_in_seconds());
        let cost = f64::from(request.cost());
        let key = BucketKey::new(request.identity(), request.endpoint());

        trace!(key = %key, cost = request.cost(), "Checking token bucket");

        loop {
            let bucket = self.bucket(&key, capacity, refill_rate, now);
            let mut state = bucket.lock();
            if state.evicted {
                continue;
            }

            state.refill(now, capacity, refill_rate);

            if state.tokens >= cost {
                state.tokens -= cost;
                return RateLimitResult::allow(
                    Some(state.tokens.floor() as u64),
                    "Request allowed by token bucket.",
                );
            }

            let missing = cost - state.tokens;
            let retry_after_ms = if refill_rate > 0.0 {
                Some((missing / refill_rate * 1000.0).ceil() as u64)
            } else {
                None
            };

            debug!(
                key = %key,
                tokens = state.tokens,
                cost = request.cost(),
                retry_after_ms = ?retry_after_ms,
                "Token bucket limit exceeded"
            );

            return RateLimitResult::deny(DecisionReason::LimitExceeded, "Token bucket limit exceeded.")
                .with_retry_after_ms(retry_after_ms)
                .with_remaining(Some(state.tokens.max(0.0).floor() as u64));
        }
    }

    /// Find the bucket for `key`, creating it full if it does not exist.
    fn bucket(
        &self,
        key: &BucketKey,
        capacity: f64,
        refill_rate: f64,
        now: DateTime<Utc>,
    ) -> Arc<Mutex<BucketState>> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let bucket = self.buckets.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, capacity, "Creating new token bucket");
            Arc::new(Mutex::new(BucketState::new(capacity, refill_rate, now)))
        });
        Arc::clone(bucket.value())
    }

    /// Current token count of a bucket without refilling it.
    ///
    /// Returns `None` if the bucket does not exist.
    pub fn tokens(&self, identity: &str, endpoint: &str) -> Option<f64> {
        self.buckets
            .get(&BucketKey::new(identity, endpoint))
            .map(|bucket| bucket.lock().tokens)
    }

    /// Get the number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Clear all buckets.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Drop buckets that have not been touched for longer than `idle_ttl`
    /// and would already have refilled to capacity.
    ///
    /// A dropped bucket comes back full on its next use, which is exactly
    /// the state it would have refilled to, so eviction is invisible to
    /// callers whatever the policy window.
    pub fn evict_idle(&self, idle_ttl: Duration) -> usize {
        let now = self.clock.now();
        let Some(cutoff) = now.checked_sub_signed(idle_ttl) else {
            return 0;
        };
        let before = self.buckets.len();

        self.buckets.retain(|_, bucket| {
            let mut state = bucket.lock();
            if state.last_refill < cutoff && state.is_full_at(now) {
                state.evicted = true;
                false
            } else {
                true
            }
        });

        let evicted = before.saturating_sub(self.buckets.len());
        debug!(evicted, remaining = self.buckets.len(), "Token bucket sweep complete");
        evicted
    }

    /// Spawn a task that calls [`evict_idle`](Self::evict_idle) every
    /// `interval` until `shutdown` is cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: std::time::Duration,
        idle_ttl: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        info!(
            interval_secs = interval.as_secs(),
            idle_ttl_secs = idle_ttl.num_seconds(),
            "Starting token bucket sweeper"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Token bucket sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.evict_idle(idle_ttl);
                    }
                }
            }
        })
    }
}

#[async_trait]
impl RateLimiterBackend for TokenBucketLimiter {
    async fn check(&self, request: &RateLimitRequest, _cancel: &CancellationToken) -> RateLimitResult {
        self.try_acquire(request)
    }
}
