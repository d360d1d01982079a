//! Sliding window log rate limiter.
//!
//! Every admitted request is appended to a usage log. A new request is
//! admitted when the cost already logged for the same API key and endpoint
//! inside the trailing window, plus its own cost, stays within the limit.
//!
//! The log lives behind [`UsageLogStore`], so every step may suspend. All
//! collaborator failures and cancellations are reported as `InternalError`
//! denials; nothing is retried.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::backend::RateLimiterBackend;
use super::request::RateLimitRequest;
use super::result::{DecisionReason, RateLimitResult};
use crate::store::{ConditionalAppend, IdentityResolver, StoreError, UsageLogEntry, UsageLogStore};
use crate::time::TimeSource;

/// How the read-then-append step is protected against concurrent writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowConsistency {
    /// Sum, then append, as two separate store calls. Concurrent checks for
    /// the same key and endpoint can both pass the sum before either appends,
    /// so the window may end up above its limit.
    Parity,
    /// One conditional append that sums and inserts atomically in the store.
    #[default]
    Atomic,
}

/// Why a check stopped before producing a decision.
#[derive(Debug)]
enum Abort {
    Cancelled,
    Store(&'static str, StoreError),
}

impl Abort {
    fn into_result(self) -> RateLimitResult {
        match self {
            Abort::Cancelled => {
                RateLimitResult::internal_error("Sliding window evaluation cancelled.")
            }
            Abort::Store(step, err) => {
                warn!(step, error = %err, "Sliding window store failure");
                RateLimitResult::internal_error(format!(
                    "Sliding window evaluation failed during {}: {}",
                    step, err
                ))
            }
        }
    }
}

/// Run one store call unless `cancel` fires first.
async fn guarded<T, F>(cancel: &CancellationToken, step: &'static str, io: F) -> Result<T, Abort>
where
    F: Future<Output = Result<T, StoreError>>,
{
    if cancel.is_cancelled() {
        return Err(Abort::Cancelled);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Abort::Cancelled),
        outcome = io => outcome.map_err(|err| Abort::Store(step, err)),
    }
}

/// Sliding window log limiter backed by a [`UsageLogStore`].
pub struct SlidingWindowLogLimiter {
    identities: Arc<dyn IdentityResolver>,
    log: Arc<dyn UsageLogStore>,
    clock: Arc<dyn TimeSource>,
    consistency: WindowConsistency,
}

impl SlidingWindowLogLimiter {
    pub fn new(
        identities: Arc<dyn IdentityResolver>,
        log: Arc<dyn UsageLogStore>,
        clock: Arc<dyn TimeSource>,
        consistency: WindowConsistency,
    ) -> Self {
        Self {
            identities,
            log,
            clock,
            consistency,
        }
    }

    pub fn consistency(&self) -> WindowConsistency {
        self.consistency
    }

    async fn evaluate(
        &self,
        request: &RateLimitRequest,
        cancel: &CancellationToken,
    ) -> Result<RateLimitResult, Abort> {
        let now = self.clock.now();

        let key = guarded(cancel, "api key lookup", self.identities.resolve_key(request.identity())).await?;
        let key_id = match key {
            Some(key) if key.is_active => key.key_id,
            _ => {
                return Ok(RateLimitResult::deny(
                    DecisionReason::ApiKeyInvalidOrInactive,
                    "API key is invalid or inactive (sliding window).",
                ));
            }
        };

        let window = Duration::seconds(i64::from(request.window_in_seconds()));
        let window_start = now - window;
        let limit = u64::from(request.limit());
        let cost = u64::from(request.cost());
        let entry = UsageLogEntry {
            key_id,
            endpoint: request.endpoint().to_string(),
            occurred_at: now,
            cost: request.cost(),
        };

        trace!(
            key_id,
            endpoint = request.endpoint(),
            cost,
            limit,
            consistency = ?self.consistency,
            "Checking sliding window log"
        );

        let used = match self.consistency {
            WindowConsistency::Parity => {
                let used = guarded(
                    cancel,
                    "usage sum",
                    self.log.sum_cost(key_id, request.endpoint(), window_start, now),
                )
                .await?;

                if used + cost > limit {
                    return self.deny(request, key_id, window_start, now, used, cancel).await;
                }

                guarded(cancel, "usage append", self.log.append(entry)).await?;
                used
            }
            WindowConsistency::Atomic => {
                let outcome = guarded(
                    cancel,
                    "conditional usage append",
                    self.log.append_within_limit(entry, window_start, limit),
                )
                .await?;

                match outcome {
                    ConditionalAppend::Appended { used_before } => used_before,
                    ConditionalAppend::Rejected { used } => {
                        return self.deny(request, key_id, window_start, now, used, cancel).await;
                    }
                }
            }
        };

        Ok(RateLimitResult::allow(
            Some(limit.saturating_sub(used + cost)),
            "Request allowed by sliding window log.",
        ))
    }

    /// Build the `LimitExceeded` denial, hinting when the oldest in-window
    /// entry will fall out of the window.
    async fn deny(
        &self,
        request: &RateLimitRequest,
        key_id: u64,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
        used: u64,
        cancel: &CancellationToken,
    ) -> Result<RateLimitResult, Abort> {
        let oldest = guarded(
            cancel,
            "oldest entry lookup",
            self.log.oldest_in_window(key_id, request.endpoint(), window_start),
        )
        .await?;

        let window = Duration::seconds(i64::from(request.window_in_seconds()));
        let retry_after_ms = oldest.map(|occurred_at| retry_after_ms(occurred_at + window - now));
        let limit = u64::from(request.limit());

        debug!(
            key_id,
            endpoint = request.endpoint(),
            used,
            limit,
            retry_after_ms = ?retry_after_ms,
            "Sliding window limit exceeded"
        );

        Ok(
            RateLimitResult::deny(DecisionReason::LimitExceeded, "Sliding window limit exceeded.")
                .with_retry_after_ms(retry_after_ms)
                .with_remaining(Some(limit.saturating_sub(used))),
        )
    }
}

/// Whole milliseconds until `wait` has elapsed, rounded up and never negative.
fn retry_after_ms(wait: Duration) -> u64 {
    if wait <= Duration::zero() {
        return 0;
    }
    let micros = wait.num_microseconds().unwrap_or(i64::MAX);
    u64::try_from(micros).unwrap_or(u64::MAX).div_ceil(1000)
}

#[async_trait]
impl RateLimiterBackend for SlidingWindowLogLimiter {
    async fn check(&self, request: &RateLimitRequest, cancel: &CancellationToken) -> RateLimitResult {
        match self.evaluate(request, cancel).await {
            Ok(result) => result,
            Err(abort) => abort.into_result(),
        }
    }
}
