//! In-memory collaborators.
//!
//! `MemoryDirectory` serves API keys and policies from a YAML seed, and
//! `MemoryUsageLog` keeps the sliding window log in process memory. Both are
//! safe to share across tasks.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    ConditionalAppend, IdentityResolver, PolicySource, ResolvedKey, StoreError, UsageLogEntry,
    UsageLogStore,
};
use crate::error::{RateGateError, Result};
use crate::ratelimit::{Algorithm, Policy};
use crate::time::TimeSource;

/// Seed document for [`MemoryDirectory`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub tenants: Vec<TenantSeed>,
}

/// A tenant with its keys and policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSeed {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub api_keys: Vec<ApiKeySeed>,
    /// Policies in registration order.
    #[serde(default)]
    pub policies: Vec<Policy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeySeed {
    pub id: u64,
    pub key: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Tenants, API keys and policies held in memory.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    /// Raw key string -> resolved principal
    keys: DashMap<String, ResolvedKey>,
    /// Owner id -> policies in registration order
    policies: RwLock<HashMap<u64, Vec<Policy>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a directory seed from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading tenant directory");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a directory seed from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let seed: DirectorySeed = serde_yaml::from_str(yaml)?;
        Self::from_seed(seed)
    }

    /// Build a directory, rejecting duplicate tenant ids, key ids or key strings.
    pub fn from_seed(seed: DirectorySeed) -> Result<Self> {
        let directory = Self::new();
        let mut tenant_ids = HashSet::new();
        let mut key_ids = HashSet::new();

        for tenant in seed.tenants {
            if !tenant_ids.insert(tenant.id) {
                return Err(RateGateError::Config(format!(
                    "duplicate tenant id {}",
                    tenant.id
                )));
            }

            for key in &tenant.api_keys {
                if key.key.trim().is_empty() {
                    return Err(RateGateError::Config(format!(
                        "api key {} of tenant {} is empty",
                        key.id, tenant.id
                    )));
                }
                if !key_ids.insert(key.id) {
                    return Err(RateGateError::Config(format!("duplicate api key id {}", key.id)));
                }
                if directory.keys.contains_key(&key.key) {
                    return Err(RateGateError::Config(format!(
                        "api key {} is registered twice",
                        key.id
                    )));
                }
                directory.add_key(tenant.id, key.id, &key.key, key.active);
            }

            for policy in tenant.policies {
                directory.add_policy(tenant.id, policy);
            }

            debug!(tenant = tenant.id, name = %tenant.name, "Loaded tenant");
        }

        info!(
            keys = directory.keys.len(),
            tenants = tenant_ids.len(),
            "Tenant directory loaded"
        );
        Ok(directory)
    }

    /// Register or replace an API key.
    pub fn add_key(&self, owner_id: u64, key_id: u64, raw_key: &str, is_active: bool) {
        self.keys.insert(
            raw_key.to_string(),
            ResolvedKey {
                key_id,
                owner_id,
                is_active,
            },
        );
    }

    /// Flip a key's active flag. Returns `false` if the key is unknown.
    pub fn set_key_active(&self, raw_key: &str, is_active: bool) -> bool {
        match self.keys.get_mut(raw_key) {
            Some(mut key) => {
                key.is_active = is_active;
                true
            }
            None => false,
        }
    }

    /// Append a policy to the owner's list.
    pub fn add_policy(&self, owner_id: u64, mut policy: Policy) {
        policy.owner_id = owner_id;
        self.policies.write().entry(owner_id).or_default().push(policy);
    }

    /// Largest positive window among the sliding window log policies of all
    /// tenants.
    pub fn longest_sliding_window(&self) -> Option<Duration> {
        self.policies
            .read()
            .values()
            .flatten()
            .filter(|policy| policy.algorithm == Algorithm::SlidingWindowLog)
            .filter(|policy| policy.window_in_seconds > 0)
            .map(|policy| policy.window_in_seconds)
            .max()
            .and_then(Duration::try_seconds)
    }
}

#[async_trait]
impl IdentityResolver for MemoryDirectory {
    async fn resolve_key(&self, raw_key: &str) -> std::result::Result<Option<ResolvedKey>, StoreError> {
        Ok(self.keys.get(raw_key).map(|key| key.clone()))
    }
}

#[async_trait]
impl PolicySource for MemoryDirectory {
    async fn policies_for(&self, owner_id: u64) -> std::result::Result<Vec<Policy>, StoreError> {
        Ok(self.policies.read().get(&owner_id).cloned().unwrap_or_default())
    }
}

type LogKey = (u64, String);

/// Sliding window log held in memory, one append-only vector per
/// `(key_id, endpoint)`.
#[derive(Debug, Default)]
pub struct MemoryUsageLog {
    logs: DashMap<LogKey, Vec<UsageLogEntry>>,
}

impl MemoryUsageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry that occurred before `cutoff`. Returns how many were
    /// removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.logs.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| entry.occurred_at >= cutoff);
            removed += before - entries.len();
            !entries.is_empty()
        });

        debug!(removed, remaining = self.entry_count(), "Usage log pruned");
        removed
    }

    /// Total number of entries across all keys.
    pub fn entry_count(&self) -> usize {
        self.logs.iter().map(|entries| entries.len()).sum()
    }

    /// Prune entries older than `retention`, extended to the longest sliding
    /// window in `directory` so no entry still inside a window is dropped.
    pub fn prune_expired(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
        directory: &MemoryDirectory,
    ) -> usize {
        let keep = match directory.longest_sliding_window() {
            Some(window) if window > retention => {
                debug!(
                    window_secs = window.num_seconds(),
                    retention_secs = retention.num_seconds(),
                    "Extending usage log retention to the longest sliding window"
                );
                window
            }
            _ => retention,
        };

        match now.checked_sub_signed(keep) {
            Some(cutoff) => self.prune_before(cutoff),
            None => 0,
        }
    }

    /// Spawn a task that calls [`prune_expired`](Self::prune_expired) every
    /// `interval` until `shutdown` is cancelled.
    pub fn spawn_pruner(
        self: Arc<Self>,
        clock: Arc<dyn TimeSource>,
        directory: Arc<MemoryDirectory>,
        interval: std::time::Duration,
        retention: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        info!(
            interval_secs = interval.as_secs(),
            retention_secs = retention.num_seconds(),
            "Starting usage log pruner"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Usage log pruner stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.prune_expired(clock.now(), retention, &directory);
                    }
                }
            }
        })
    }
}

fn window_sum<'a>(
    entries: impl Iterator<Item = &'a UsageLogEntry>,
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> u64 {
    entries
        .filter(|entry| entry.occurred_at >= window_start && entry.occurred_at <= now)
        .map(|entry| u64::from(entry.cost))
        .sum()
}

#[async_trait]
impl UsageLogStore for MemoryUsageLog {
    async fn sum_cost(
        &self,
        key_id: u64,
        endpoint: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> std::result::Result<u64, StoreError> {
        let used = self
            .logs
            .get(&(key_id, endpoint.to_string()))
            .map(|entries| window_sum(entries.iter(), window_start, now))
            .unwrap_or(0);
        Ok(used)
    }

    async fn oldest_in_window(
        &self,
        key_id: u64,
        endpoint: &str,
        window_start: DateTime<Utc>,
    ) -> std::result::Result<Option<DateTime<Utc>>, StoreError> {
        let oldest = self.logs.get(&(key_id, endpoint.to_string())).and_then(|entries| {
            entries
                .iter()
                .map(|entry| entry.occurred_at)
                .filter(|at| *at >= window_start)
                .min()
        });
        Ok(oldest)
    }

    async fn append(&self, entry: UsageLogEntry) -> std::result::Result<(), StoreError> {
        self.logs
            .entry((entry.key_id, entry.endpoint.clone()))
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn append_within_limit(
        &self,
        entry: UsageLogEntry,
        window_start: DateTime<Utc>,
        limit: u64,
    ) -> std::result::Result<ConditionalAppend, StoreError> {
        // The entry guard holds the shard write lock for the whole sum + push.
        let mut entries = self
            .logs
            .entry((entry.key_id, entry.endpoint.clone()))
            .or_default();

        let used = window_sum(entries.iter(), window_start, entry.occurred_at);
        if used + u64::from(entry.cost) > limit {
            return Ok(ConditionalAppend::Rejected { used });
        }

        entries.push(entry);
        Ok(ConditionalAppend::Appended { used_before: used })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{RateLimitRequest, RateLimiterBackend, SlidingWindowLogLimiter, WindowConsistency};
    use crate::time::ManualTimeSource;

    const SEED: &str = r#"
tenants:
  - id: 1
    name: acme
    api_keys:
      - id: 10
        key: acme-live
      - id: 11
        key: acme-old
        active: false
    policies:
      - id: 100
        name: default
        endpoint_pattern: "*"
        algorithm: token_bucket
        limit: 100
        window_in_seconds: 60
      - id: 101
        name: exports
        endpoint_pattern: /exports/*
        algorithm: sliding_window_log
        limit: 5
        window_in_seconds: 3600
  - id: 2
    name: globex
    api_keys:
      - id: 20
        key: globex-live
"#;

    fn entry(key_id: u64, endpoint: &str, at: DateTime<Utc>, cost: u32) -> UsageLogEntry {
        UsageLogEntry {
            key_id,
            endpoint: endpoint.to_string(),
            occurred_at: at,
            cost,
        }
    }

    #[tokio::test]
    async fn test_directory_from_yaml() {
        let directory = MemoryDirectory::from_yaml(SEED).unwrap();

        let key = directory.resolve_key("acme-live").await.unwrap().unwrap();
        assert_eq!(key.key_id, 10);
        assert_eq!(key.owner_id, 1);
        assert!(key.is_active);

        let old = directory.resolve_key("acme-old").await.unwrap().unwrap();
        assert!(!old.is_active);

        assert!(directory.resolve_key("nope").await.unwrap().is_none());

        let policies = directory.policies_for(1).await.unwrap();
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[0].id, 100);
        assert_eq!(policies[1].algorithm, Algorithm::SlidingWindowLog);
        assert!(policies.iter().all(|p| p.owner_id == 1));

        assert!(directory.policies_for(2).await.unwrap().is_empty());
        assert_eq!(directory.longest_sliding_window(), Some(Duration::seconds(3600)));
    }

    #[test]
    fn test_directory_rejects_duplicate_keys() {
        let yaml = r#"
tenants:
  - id: 1
    name: a
    api_keys:
      - id: 1
        key: same
  - id: 2
    name: b
    api_keys:
      - id: 2
        key: same
"#;
        assert!(matches!(
            MemoryDirectory::from_yaml(yaml),
            Err(RateGateError::Config(_))
        ));
    }

    #[test]
    fn test_directory_rejects_duplicate_tenants() {
        let yaml = r#"
tenants:
  - id: 1
    name: a
  - id: 1
    name: b
"#;
        assert!(MemoryDirectory::from_yaml(yaml).is_err());
    }

    #[tokio::test]
    async fn test_set_key_active() {
        let directory = MemoryDirectory::new();
        directory.add_key(1, 10, "k", true);

        assert!(directory.set_key_active("k", false));
        assert!(!directory.resolve_key("k").await.unwrap().unwrap().is_active);
        assert!(!directory.set_key_active("missing", false));
    }

    #[tokio::test]
    async fn test_usage_log_sum_and_oldest() {
        let log = MemoryUsageLog::new();
        let now = Utc::now();

        log.append(entry(1, "/a", now - Duration::seconds(30), 2)).await.unwrap();
        log.append(entry(1, "/a", now - Duration::seconds(5), 3)).await.unwrap();
        log.append(entry(1, "/b", now - Duration::seconds(5), 7)).await.unwrap();
        log.append(entry(2, "/a", now - Duration::seconds(5), 11)).await.unwrap();

        let window_start = now - Duration::seconds(10);
        assert_eq!(log.sum_cost(1, "/a", window_start, now).await.unwrap(), 3);
        assert_eq!(
            log.oldest_in_window(1, "/a", window_start).await.unwrap(),
            Some(now - Duration::seconds(5))
        );

        let wide = now - Duration::seconds(60);
        assert_eq!(log.sum_cost(1, "/a", wide, now).await.unwrap(), 5);
        assert_eq!(
            log.oldest_in_window(1, "/a", wide).await.unwrap(),
            Some(now - Duration::seconds(30))
        );

        assert_eq!(log.sum_cost(3, "/a", wide, now).await.unwrap(), 0);
        assert_eq!(log.oldest_in_window(3, "/a", wide).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_append_within_limit() {
        let log = MemoryUsageLog::new();
        let now = Utc::now();
        let window_start = now - Duration::seconds(10);

        let first = log
            .append_within_limit(entry(1, "/a", now, 3), window_start, 4)
            .await
            .unwrap();
        assert_eq!(first, ConditionalAppend::Appended { used_before: 0 });

        let second = log
            .append_within_limit(entry(1, "/a", now, 2), window_start, 4)
            .await
            .unwrap();
        assert_eq!(second, ConditionalAppend::Rejected { used: 3 });
        assert_eq!(log.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_prune_before() {
        let log = MemoryUsageLog::new();
        let now = Utc::now();

        log.append(entry(1, "/a", now - Duration::hours(2), 1)).await.unwrap();
        log.append(entry(1, "/a", now, 1)).await.unwrap();
        log.append(entry(2, "/a", now - Duration::hours(3), 1)).await.unwrap();

        assert_eq!(log.prune_before(now - Duration::hours(1)), 2);
        assert_eq!(log.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_pruner_runs_until_shutdown() {
        let clock = Arc::new(ManualTimeSource::default());
        let log = Arc::new(MemoryUsageLog::new());
        log.append(entry(1, "/a", clock.now(), 1)).await.unwrap();
        clock.advance(Duration::hours(2));

        let shutdown = CancellationToken::new();
        let handle = log.clone().spawn_pruner(
            clock,
            Arc::new(MemoryDirectory::new()),
            std::time::Duration::from_millis(10),
            Duration::hours(1),
            shutdown.clone(),
        );

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(log.entry_count(), 0);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_prune_never_cuts_into_a_sliding_window() {
        let clock = Arc::new(ManualTimeSource::default());
        let directory = Arc::new(MemoryDirectory::new());
        directory.add_key(1, 10, "live", true);
        directory.add_policy(
            1,
            Policy {
                id: 1,
                owner_id: 1,
                name: "hourly".to_string(),
                endpoint_pattern: "/reports".to_string(),
                algorithm: Algorithm::SlidingWindowLog,
                limit: 1,
                window_in_seconds: 3600,
                burst_limit: None,
            },
        );
        let log = Arc::new(MemoryUsageLog::new());
        let limiter = SlidingWindowLogLimiter::new(
            directory.clone(),
            log.clone(),
            clock.clone(),
            WindowConsistency::Atomic,
        );
        let cancel = CancellationToken::new();
        let req = RateLimitRequest::new("live", "/reports", 1, 3600).unwrap();

        assert!(limiter.check(&req, &cancel).await.is_allowed());
        clock.advance(Duration::seconds(120));

        // Retention is shorter than the window, so the window wins.
        assert_eq!(log.prune_expired(clock.now(), Duration::seconds(60), &directory), 0);
        assert_eq!(log.entry_count(), 1);
        assert!(!limiter.check(&req, &cancel).await.is_allowed());

        // Past the window the entry is fair game.
        clock.advance(Duration::seconds(3600));
        assert_eq!(log.prune_expired(clock.now(), Duration::seconds(60), &directory), 1);
        assert!(limiter.check(&req, &cancel).await.is_allowed());
    }

    #[tokio::test]
    async fn test_prune_uses_retention_without_sliding_policies() {
        let log = MemoryUsageLog::new();
        let now = Utc::now();
        log.append(entry(1, "/a", now - Duration::seconds(120), 1)).await.unwrap();
        log.append(entry(1, "/a", now - Duration::seconds(30), 1)).await.unwrap();

        assert_eq!(log.prune_expired(now, Duration::seconds(60), &MemoryDirectory::new()), 1);
        assert_eq!(log.entry_count(), 1);
    }
}
