//! Decision dispatcher.
//!
//! Turns a raw `(api key, endpoint, cost)` triple into a decision: resolve the
//! key, pick the tenant's policy for the endpoint, build a
//! [`RateLimitRequest`] from it and hand that to the algorithm the policy
//! names. Every failure along the way ends up as a denial.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::backend::RateLimiterBackend;
use super::request::RateLimitRequest;
use super::result::{DecisionReason, RateLimitResult};
use super::rules::{match_policy, Algorithm};
use super::sliding_window::SlidingWindowLogLimiter;
use super::token_bucket::TokenBucketLimiter;
use crate::error::Result;
use crate::store::{IdentityResolver, PolicySource};

/// Routes each check to the algorithm selected by the tenant's policy.
pub struct DecisionDispatcher {
    identities: Arc<dyn IdentityResolver>,
    policies: Arc<dyn PolicySource>,
    token_bucket: Arc<TokenBucketLimiter>,
    sliding_window: Arc<SlidingWindowLogLimiter>,
}

impl DecisionDispatcher {
    pub fn new(
        identities: Arc<dyn IdentityResolver>,
        policies: Arc<dyn PolicySource>,
        token_bucket: Arc<TokenBucketLimiter>,
        sliding_window: Arc<SlidingWindowLogLimiter>,
    ) -> Self {
        Self {
            identities,
            policies,
            token_bucket,
            sliding_window,
        }
    }

    pub fn token_bucket(&self) -> &Arc<TokenBucketLimiter> {
        &self.token_bucket
    }

    /// Decide whether a call is admitted.
    ///
    /// `cost` defaults to 1. Always returns a well-formed result: collaborator
    /// errors, invalid policies, cancellation and panics all become
    /// `InternalError` denials.
    #[instrument(skip_all, fields(endpoint = %endpoint, cost = ?cost))]
    pub async fn decide(
        &self,
        raw_identity: &str,
        endpoint: &str,
        cost: Option<i64>,
        cancel: &CancellationToken,
    ) -> RateLimitResult {
        let evaluation = AssertUnwindSafe(self.evaluate(raw_identity, endpoint, cost, cancel)).catch_unwind();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                RateLimitResult::internal_error("Rate limit evaluation cancelled.")
            }
            outcome = evaluation => match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    warn!(error = %err, "Rate limit evaluation failed");
                    RateLimitResult::internal_error(format!(
                        "An internal error occurred while evaluating the rate limit: {}",
                        err
                    ))
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(panic = %reason, "Rate limit evaluation panicked");
                    RateLimitResult::internal_error(format!(
                        "An internal error occurred while evaluating the rate limit: {}",
                        reason
                    ))
                }
            }
        };

        info!(
            allowed = result.is_allowed(),
            reason = %result.reason(),
            remaining = ?result.remaining(),
            retry_after_ms = ?result.retry_after_ms(),
            "Rate limit decision made"
        );
        result
    }

    async fn evaluate(
        &self,
        raw_identity: &str,
        endpoint: &str,
        cost: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<RateLimitResult> {
        let key = match self.identities.resolve_key(raw_identity).await? {
            Some(key) if key.is_active => key,
            _ => {
                debug!("Unknown or inactive API key");
                return Ok(RateLimitResult::deny(
                    DecisionReason::ApiKeyInvalidOrInactive,
                    "API key is invalid or inactive.",
                ));
            }
        };

        let policies = self.policies.policies_for(key.owner_id).await?;
        let Some(policy) = match_policy(&policies, endpoint) else {
            debug!(owner_id = key.owner_id, policies = policies.len(), "No policy matched");
            return Ok(RateLimitResult::deny(
                DecisionReason::NoMatchingPolicy,
                "No matching rate limit policy found for this endpoint.",
            ));
        };

        debug!(
            policy_id = policy.id,
            policy = %policy.name,
            algorithm = %policy.algorithm,
            limit = policy.limit,
            window_in_seconds = policy.window_in_seconds,
            "Matched policy"
        );

        let request = RateLimitRequest::builder(raw_identity, endpoint)
            .cost(cost.unwrap_or(i64::from(RateLimitRequest::DEFAULT_COST)))
            .limit(policy.limit)
            .window_in_seconds(policy.window_in_seconds)
            .burst_limit(policy.burst_limit)
            .build()?;

        let result = match &policy.algorithm {
            Algorithm::TokenBucket => self.token_bucket.check(&request, cancel).await,
            Algorithm::SlidingWindowLog => self.sliding_window.check(&request, cancel).await,
            Algorithm::Unsupported(tag) => {
                warn!(policy_id = policy.id, algorithm = %tag, "Policy names an unsupported algorithm");
                RateLimitResult::internal_error(format!(
                    "Rate limit algorithm '{}' is not supported.",
                    tag
                ))
            }
        };

        Ok(result)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
