//! Rate limit request descriptor.

use std::num::NonZeroU32;
use thiserror::Error;

/// Reasons a [`RateLimitRequest`] can be rejected at construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("identity must be provided")]
    EmptyIdentity,
    #[error("endpoint must be provided")]
    EmptyEndpoint,
    #[error("cost must be a positive 32-bit integer, got {0}")]
    InvalidCost(i64),
    #[error("limit must be a positive 32-bit integer, got {0}")]
    InvalidLimit(i64),
    #[error("window must be a positive 32-bit number of seconds, got {0}")]
    InvalidWindow(i64),
    #[error("burst limit must be a positive 32-bit integer, got {0}")]
    InvalidBurst(i64),
}

/// A single admission check, fully resolved against a policy.
///
/// Built once per call and never mutated. Every field is validated up front so
/// the algorithms can rely on positive cost, limit and window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRequest {
    identity: String,
    endpoint: String,
    cost: NonZeroU32,
    limit: NonZeroU32,
    window_in_seconds: NonZeroU32,
    burst_limit: Option<NonZeroU32>,
}

impl RateLimitRequest {
    /// Default cost of a request when the caller does not specify one.
    pub const DEFAULT_COST: u32 = 1;

    /// Create a request with the default cost.
    pub fn new(
        identity: impl Into<String>,
        endpoint: impl Into<String>,
        limit: i64,
        window_in_seconds: i64,
    ) -> Result<Self, RequestError> {
        Self::builder(identity, endpoint)
            .limit(limit)
            .window_in_seconds(window_in_seconds)
            .build()
    }

    /// Start building a request for the given identity and endpoint.
    pub fn builder(identity: impl Into<String>, endpoint: impl Into<String>) -> RateLimitRequestBuilder {
        RateLimitRequestBuilder {
            identity: identity.into(),
            endpoint: endpoint.into(),
            cost: i64::from(Self::DEFAULT_COST),
            limit: 0,
            window_in_seconds: 0,
            burst_limit: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn cost(&self) -> u32 {
        self.cost.get()
    }

    /// Maximum units allowed per window.
    pub fn limit(&self) -> u32 {
        self.limit.get()
    }

    pub fn window_in_seconds(&self) -> u32 {
        self.window_in_seconds.get()
    }

    /// Reserved burst allowance. Carried through but not consumed by either
    /// algorithm.
    pub fn burst_limit(&self) -> Option<u32> {
        self.burst_limit.map(NonZeroU32::get)
    }
}

/// Builder for [`RateLimitRequest`]. Validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct RateLimitRequestBuilder {
    identity: String,
    endpoint: String,
    cost: i64,
    limit: i64,
    window_in_seconds: i64,
    burst_limit: Option<i64>,
}

impl RateLimitRequestBuilder {
    pub fn cost(mut self, cost: i64) -> Self {
        self.cost = cost;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn window_in_seconds(mut self, window_in_seconds: i64) -> Self {
        self.window_in_seconds = window_in_seconds;
        self
    }

    pub fn burst_limit(mut self, burst_limit: Option<i64>) -> Self {
        self.burst_limit = burst_limit;
        self
    }

    pub fn build(self) -> Result<RateLimitRequest, RequestError> {
        if self.identity.trim().is_empty() {
            return Err(RequestError::EmptyIdentity);
        }
        if self.endpoint.trim().is_empty() {
            return Err(RequestError::EmptyEndpoint);
        }

        let cost = positive(self.cost).ok_or(RequestError::InvalidCost(self.cost))?;
        let limit = positive(self.limit).ok_or(RequestError::InvalidLimit(self.limit))?;
        let window_in_seconds = positive(self.window_in_seconds)
            .ok_or(RequestError::InvalidWindow(self.window_in_seconds))?;
        let burst_limit = match self.burst_limit {
            Some(burst) => Some(positive(burst).ok_or(RequestError::InvalidBurst(burst))?),
            None => None,
        };

        Ok(RateLimitRequest {
            identity: self.identity,
            endpoint: self.endpoint,
            cost,
            limit,
            window_in_seconds,
            burst_limit,
        })
    }
}

fn positive(value: i64) -> Option<NonZeroU32> {
    u32::try_from(value).ok().and_then(NonZeroU32::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_cost_to_one() {
        let request = RateLimitRequest::new("key", "/orders", 10, 60).unwrap();

        assert_eq!(request.identity(), "key");
        assert_eq!(request.endpoint(), "/orders");
        assert_eq!(request.cost(), 1);
        assert_eq!(request.limit(), 10);
        assert_eq!(request.window_in_seconds(), 60);
        assert_eq!(request.burst_limit(), None);
    }

    #[test]
    fn test_request_carries_burst_limit() {
        let request = RateLimitRequest::builder("key", "/orders")
            .cost(3)
            .limit(10)
            .window_in_seconds(60)
            .burst_limit(Some(20))
            .build()
            .unwrap();

        assert_eq!(request.cost(), 3);
        assert_eq!(request.burst_limit(), Some(20));
    }

    #[test]
    fn test_empty_identity_rejected() {
        assert_eq!(
            RateLimitRequest::new("", "/orders", 10, 60),
            Err(RequestError::EmptyIdentity)
        );
        assert_eq!(
            RateLimitRequest::new("   ", "/orders", 10, 60),
            Err(RequestError::EmptyIdentity)
        );
    }

    #[test]
    fn test_empty_endpoint_rejected() {
        assert_eq!(
            RateLimitRequest::new("key", "", 10, 60),
            Err(RequestError::EmptyEndpoint)
        );
    }

    #[test]
    fn test_non_positive_numbers_rejected() {
        let err = RateLimitRequest::builder("key", "/e")
            .cost(0)
            .limit(10)
            .window_in_seconds(10)
            .build();
        assert_eq!(err, Err(RequestError::InvalidCost(0)));

        let err = RateLimitRequest::builder("key", "/e")
            .cost(-2)
            .limit(10)
            .window_in_seconds(10)
            .build();
        assert_eq!(err, Err(RequestError::InvalidCost(-2)));

        assert_eq!(
            RateLimitRequest::new("key", "/e", 0, 10),
            Err(RequestError::InvalidLimit(0))
        );
        assert_eq!(
            RateLimitRequest::new("key", "/e", 10, -1),
            Err(RequestError::InvalidWindow(-1))
        );

        let err = RateLimitRequest::builder("key", "/e")
            .limit(10)
            .window_in_seconds(10)
            .burst_limit(Some(0))
            .build();
        assert_eq!(err, Err(RequestError::InvalidBurst(0)));
    }

    #[test]
    fn test_values_beyond_u32_rejected() {
        let too_big = i64::from(u32::MAX) + 1;
        assert_eq!(
            RateLimitRequest::new("key", "/e", too_big, 10),
            Err(RequestError::InvalidLimit(too_big))
        );
    }
}
