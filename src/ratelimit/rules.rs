//! Rate limit policies and endpoint matching.
//!
//! A tenant owns a list of [`Policy`] rules. Each rule binds an endpoint
//! pattern to an algorithm and its limit/window parameters. Patterns come in
//! three kinds, in order of precedence:
//!
//! - exact (`/orders/export`), compared case-insensitively (Unicode case
//!   folding, not just ASCII)
//! - prefix (`/orders/*`), matching anything under `/orders/`
//! - wildcard (`*`), matching every endpoint
//!
//! Within a kind the first rule in the tenant's list wins.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Algorithm a policy asks for.
///
/// Tags that are not recognized are kept verbatim in `Unsupported` so the
/// dispatcher can report them instead of failing to load the policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Algorithm {
    TokenBucket,
    SlidingWindowLog,
    Unsupported(String),
}

impl Algorithm {
    /// Parse an algorithm tag. Case, `_` and `-` are ignored, so
    /// `token_bucket`, `TokenBucket` and `token-bucket` are the same tag.
    pub fn from_tag(tag: &str) -> Self {
        let normalized: String = tag
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "tokenbucket" => Algorithm::TokenBucket,
            "slidingwindowlog" => Algorithm::SlidingWindowLog,
            _ => Algorithm::Unsupported(tag.to_string()),
        }
    }

    pub fn as_tag(&self) -> &str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindowLog => "sliding_window_log",
            Algorithm::Unsupported(tag) => tag,
        }
    }
}

impl From<String> for Algorithm {
    fn from(tag: String) -> Self {
        Algorithm::from_tag(&tag)
    }
}

impl From<Algorithm> for String {
    fn from(algorithm: Algorithm) -> Self {
        algorithm.as_tag().to_string()
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// A per-tenant rate limit rule.
///
/// Owned by the administration side; the decision engine only reads it.
/// Numeric fields are kept wide so malformed rules surface as request
/// construction errors at decision time rather than load failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: u64,
    /// Tenant that owns this policy. Filled in by the directory on load.
    #[serde(default)]
    pub owner_id: u64,
    pub name: String,
    pub endpoint_pattern: String,
    pub algorithm: Algorithm,
    pub limit: i64,
    pub window_in_seconds: i64,
    #[serde(default)]
    pub burst_limit: Option<i64>,
}

/// The parsed shape of a policy's endpoint pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointPattern<'a> {
    /// Matches only the identical endpoint (ignoring case).
    Exact(&'a str),
    /// Matches endpoints starting with the stored prefix, which keeps its
    /// trailing `/`.
    Prefix(&'a str),
    /// Matches everything.
    Wildcard,
}

impl<'a> EndpointPattern<'a> {
    pub fn parse(pattern: &'a str) -> Self {
        if pattern == "*" {
            EndpointPattern::Wildcard
        } else if let Some(prefix) = pattern.strip_suffix('*').filter(|p| p.ends_with('/')) {
            EndpointPattern::Prefix(prefix)
        } else {
            EndpointPattern::Exact(pattern)
        }
    }

    pub fn matches(&self, endpoint: &str) -> bool {
        match self {
            EndpointPattern::Exact(pattern) => folded(pattern).eq(folded(endpoint)),
            EndpointPattern::Prefix(prefix) => starts_with_ignore_case(endpoint, prefix),
            EndpointPattern::Wildcard => true,
        }
    }
}

fn folded(s: &str) -> impl Iterator<Item = char> + '_ {
    s.chars().flat_map(char::to_lowercase)
}

fn starts_with_ignore_case(haystack: &str, prefix: &str) -> bool {
    let mut haystack = folded(haystack);
    folded(prefix).all(|c| haystack.next() == Some(c))
}

/// Select the single policy that applies to `endpoint`.
///
/// One pass over the list, remembering the first match of each pattern kind.
/// Returns exact, else prefix, else wildcard, else `None`.
pub fn match_policy<'p>(policies: &'p [Policy], endpoint: &str) -> Option<&'p Policy> {
    let mut exact: Option<&Policy> = None;
    let mut prefix: Option<&Policy> = None;
    let mut wildcard: Option<&Policy> = None;

    for policy in policies {
        let pattern = EndpointPattern::parse(&policy.endpoint_pattern);
        if !pattern.matches(endpoint) {
            continue;
        }

        let slot = match pattern {
            EndpointPattern::Exact(_) => &mut exact,
            EndpointPattern::Prefix(_) => &mut prefix,
            EndpointPattern::Wildcard => &mut wildcard,
        };
        if slot.is_none() {
            *slot = Some(policy);
        }
    }

    exact.or(prefix).or(wildcard)
}
