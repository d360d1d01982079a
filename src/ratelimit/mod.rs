//! Rate limiting logic and state management.

mod backend;
mod dispatcher;
mod request;
mod result;
mod rules;
mod sliding_window;
mod token_bucket;

pub use backend::RateLimiterBackend;
pub use dispatcher::DecisionDispatcher;
pub use request::{RateLimitRequest, RateLimitRequestBuilder, RequestError};
pub use result::{DecisionReason, RateLimitResult};
pub use rules::{match_policy, Algorithm, EndpointPattern, Policy};
pub use sliding_window::{SlidingWindowLogLimiter, WindowConsistency};
pub use token_bucket::{BucketKey, TokenBucketLimiter};
