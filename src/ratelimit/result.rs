//! Rate limit decision result.

use serde::Serialize;
use std::fmt;

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DecisionReason {
    Allowed,
    ApiKeyInvalidOrInactive,
    NoMatchingPolicy,
    LimitExceeded,
    InternalError,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Allowed => "Allowed",
            DecisionReason::ApiKeyInvalidOrInactive => "ApiKeyInvalidOrInactive",
            DecisionReason::NoMatchingPolicy => "NoMatchingPolicy",
            DecisionReason::LimitExceeded => "LimitExceeded",
            DecisionReason::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of a single admission check.
///
/// Only constructible through [`allow`](Self::allow) and [`deny`](Self::deny),
/// so an allowed result always carries `DecisionReason::Allowed` and never a
/// retry hint. Serializes to the stable wire shape
/// `{ allow, reason, retryAfterMs, remaining, message }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    #[serde(rename = "allow")]
    allowed: bool,
    reason: DecisionReason,
    retry_after_ms: Option<u64>,
    remaining: Option<u64>,
    message: Option<String>,
}

impl RateLimitResult {
    /// An allowed decision.
    pub fn allow(remaining: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: DecisionReason::Allowed,
            retry_after_ms: None,
            remaining,
            message: Some(message.into()),
        }
    }

    /// A denied decision.
    ///
    /// Passing `DecisionReason::Allowed` here is a caller bug; it is coerced to
    /// `InternalError` so the result stays self-consistent.
    pub fn deny(reason: DecisionReason, message: impl Into<String>) -> Self {
        let reason = match reason {
            DecisionReason::Allowed => DecisionReason::InternalError,
            other => other,
        };
        Self {
            allowed: false,
            reason,
            retry_after_ms: None,
            remaining: None,
            message: Some(message.into()),
        }
    }

    /// Shorthand for an `InternalError` denial.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::deny(DecisionReason::InternalError, message)
    }

    /// Attach a retry hint. Ignored on allowed results.
    pub fn with_retry_after_ms(mut self, retry_after_ms: Option<u64>) -> Self {
        if !self.allowed {
            self.retry_after_ms = retry_after_ms;
        }
        self
    }

    /// Attach an approximate remaining capacity.
    pub fn with_remaining(mut self, remaining: Option<u64>) -> Self {
        self.remaining = remaining;
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn reason(&self) -> DecisionReason {
        self.reason
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        self.retry_after_ms
    }

    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_has_no_retry_hint() {
        let result = RateLimitResult::allow(Some(4), "ok").with_retry_after_ms(Some(100));

        assert!(result.is_allowed());
        assert_eq!(result.reason(), DecisionReason::Allowed);
        assert_eq!(result.retry_after_ms(), None);
        assert_eq!(result.remaining(), Some(4));
    }

    #[test]
    fn test_deny_never_reports_allowed_reason() {
        let result = RateLimitResult::deny(DecisionReason::Allowed, "bogus");

        assert!(!result.is_allowed());
        assert_eq!(result.reason(), DecisionReason::InternalError);
    }

    #[test]
    fn test_deny_with_hint() {
        let result = RateLimitResult::deny(DecisionReason::LimitExceeded, "slow down")
            .with_retry_after_ms(Some(250))
            .with_remaining(Some(0));

        assert_eq!(result.retry_after_ms(), Some(250));
        assert_eq!(result.remaining(), Some(0));
        assert_eq!(result.message(), Some("slow down"));
    }

    #[test]
    fn test_wire_shape() {
        let result = RateLimitResult::deny(DecisionReason::LimitExceeded, "slow down")
            .with_retry_after_ms(Some(250))
            .with_remaining(Some(0));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["allow"], false);
        assert_eq!(json["reason"], "LimitExceeded");
        assert_eq!(json["retryAfterMs"], 250);
        assert_eq!(json["remaining"], 0);
        assert_eq!(json["message"], "slow down");
    }
}
