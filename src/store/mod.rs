//! Collaborator interfaces consumed by the decision engine.
//!
//! The engine never owns tenants, API keys, policies or the usage log. It
//! reaches them through the traits in this module, so the same decision code
//! runs against the in-memory implementations in [`memory`] or against a real
//! database.

mod memory;

pub use memory::{ApiKeySeed, DirectorySeed, MemoryDirectory, MemoryUsageLog, TenantSeed};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ratelimit::Policy;

/// Failure reported by a collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached or answered with an error.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// An API key resolved to its internal principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key_id: u64,
    pub owner_id: u64,
    pub is_active: bool,
}

/// One logged request in the sliding window log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageLogEntry {
    pub key_id: u64,
    pub endpoint: String,
    pub occurred_at: DateTime<Utc>,
    pub cost: u32,
}

/// Outcome of [`UsageLogStore::append_within_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalAppend {
    /// The entry was written. `used_before` is the in-window cost seen by the
    /// same atomic step, excluding the new entry.
    Appended { used_before: u64 },
    /// Appending would have exceeded the limit; nothing was written.
    Rejected { used: u64 },
}

/// Resolves a presented API key to the principal behind it.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `Ok(None)` means the key is unknown.
    async fn resolve_key(&self, raw_key: &str) -> Result<Option<ResolvedKey>, StoreError>;
}

/// Lists the policies a tenant has configured.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Policies in registration order. Order matters for tie-breaking.
    async fn policies_for(&self, owner_id: u64) -> Result<Vec<Policy>, StoreError>;
}

/// Append-only log of admitted requests.
#[async_trait]
pub trait UsageLogStore: Send + Sync {
    /// Total cost logged for `(key_id, endpoint)` with
    /// `window_start <= occurred_at <= now`.
    async fn sum_cost(
        &self,
        key_id: u64,
        endpoint: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Timestamp of the oldest entry at or after `window_start`.
    async fn oldest_in_window(
        &self,
        key_id: u64,
        endpoint: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn append(&self, entry: UsageLogEntry) -> Result<(), StoreError>;

    /// Sum the window and append `entry` only if the total stays within
    /// `limit`, as one indivisible step with respect to other writers for the
    /// same `(key_id, endpoint)`.
    async fn append_within_limit(
        &self,
        entry: UsageLogEntry,
        window_start: DateTime<Utc>,
        limit: u64,
    ) -> Result<ConditionalAppend, StoreError>;
}
