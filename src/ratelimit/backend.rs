//! Rate limiter trait shared by the token bucket and sliding window log.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::request::RateLimitRequest;
use super::result::RateLimitResult;

/// Trait for rate limiter implementations.
///
/// Both algorithms take a fully resolved [`RateLimitRequest`] and always
/// answer with a [`RateLimitResult`]; failures are reported as denials, never
/// as errors. Implementations that perform I/O must honor `cancel`.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    async fn check(&self, request: &RateLimitRequest, cancel: &CancellationToken) -> RateLimitResult;
}
