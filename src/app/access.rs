//! Access control cache and quota enforcement.
//!
//! Grants resolved from the authorization service are cached for a short
//! lifetime. Admitted calls are counted in the grant's in-process session
//! counter; a maintenance loop periodically pushes those counts back to the
//! authorization service and folds them into the persisted baseline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, instrument, warn};

use crate::domain::{AccessGrant, AppError, AuthorizationService};

/// Default grant cache lifetime
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(300);
/// Default sweep and usage flush interval
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the access control cache
#[derive(Debug, Clone)]
pub struct AccessCacheConfig {
    /// How long a resolved grant is served from cache
    pub lifetime: Duration,
    /// Interval of the sweep + usage flush loop
    pub sweep_interval: Duration,
    /// Internal identity granted full access without an external call
    pub controller_access_id: Option<String>,
}

impl Default for AccessCacheConfig {
    fn default() -> Self {
        Self {
            lifetime: DEFAULT_LIFETIME,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            controller_access_id: None,
        }
    }
}

impl AccessCacheConfig {
    pub fn from_env() -> Self {
        use std::env;

        let lifetime = env::var("ACCESS_CACHE_LIFETIME_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LIFETIME);

        let sweep_interval = env::var("ACCESS_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL);

        let controller_access_id = env::var("CONTROLLER_ACCESS_ID")
            .ok()
            .filter(|v| !v.is_empty());

        Self {
            lifetime,
            sweep_interval,
            controller_access_id,
        }
    }
}

/// Result of a lifetime sweep
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Grants removed from the cache, with their unflushed session calls
    pub evicted: Vec<AccessGrant>,
    /// Entries left in the cache
    pub remaining: usize,
}

impl SweepOutcome {
    #[must_use]
    pub fn removed(&self) -> usize {
        self.evicted.len()
    }
}

/// Access identifier to cached grant
pub struct AccessControlCache {
    authorization: Arc<dyn AuthorizationService>,
    entries: DashMap<String, AccessGrant>,
    lifetime: TimeDelta,
    controller_access_id: Option<String>,
}

impl AccessControlCache {
    #[must_use]
    pub fn new(authorization: Arc<dyn AuthorizationService>, config: &AccessCacheConfig) -> Self {
        let lifetime = TimeDelta::from_std(config.lifetime).unwrap_or(TimeDelta::MAX);
        Self {
            authorization,
            entries: DashMap::new(),
            lifetime,
            controller_access_id: config.controller_access_id.clone(),
        }
    }

    fn is_fresh(&self, grant: &AccessGrant, now: DateTime<Utc>) -> bool {
        now - grant.cached_at < self.lifetime
    }

    #[must_use]
    pub fn is_controller(&self, access_id: &str) -> bool {
        self.controller_access_id.as_deref() == Some(access_id)
    }

    pub async fn resolve(&self, access_id: &str) -> Result<AccessGrant, AppError> {
        self.resolve_at(access_id, Utc::now()).await
    }

    /// Cached grant for `access_id`, fetched from the authorization service
    /// on a miss. Failures are returned as-is: there is no permissive
    /// fallback, except the controller identity which never leaves the
    /// process.
    #[instrument(skip(self, now))]
    pub async fn resolve_at(
        &self,
        access_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessGrant, AppError> {
        if let Some(mut entry) = self.entries.get_mut(access_id) {
            if self.is_fresh(&entry, now) {
                entry.last_access = now;
                return Ok(entry.clone());
            }
        }

        let mut grant = if self.is_controller(access_id) {
            AccessGrant::full_access(access_id, now)
        } else {
            let record = self.authorization.resolve(access_id).await?;
            AccessGrant::from_record(record, now)
        };

        // A refreshed grant inherits calls that were admitted but not yet
        // reported upstream.
        let grant = match self.entries.entry(access_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                grant.session_calls = occupied.get().session_calls;
                occupied.insert(grant.clone());
                grant
            }
            Entry::Vacant(vacant) => {
                vacant.insert(grant.clone());
                grant
            }
        };

        debug!(access_id = %access_id, grant_id = %grant.id, "Grant cached");
        Ok(grant)
    }

    /// Quota gate plus accounting. Runs [`AccessGrant::check_quota`] on the
    /// cached entry and, when admitted, counts the call. `grant` re-seeds
    /// the entry if a sweep evicted it in the meantime.
    pub fn admit(&self, grant: &AccessGrant, now: DateTime<Utc>) -> bool {
        let mut entry = self
            .entries
            .entry(grant.access_id.clone())
            .or_insert_with(|| grant.clone());

        if entry.check_quota(now) {
            entry.session_calls += 1;
            entry.last_access = now;
            true
        } else {
            false
        }
    }

    /// Snapshot of a cached grant without refreshing it
    #[must_use]
    pub fn peek(&self, access_id: &str) -> Option<AccessGrant> {
        self.entries.get(access_id).map(|entry| entry.clone())
    }

    pub fn sweep(&self) -> SweepOutcome {
        self.sweep_at(Utc::now())
    }

    /// Evict entries older than the cache lifetime
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepOutcome {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !self.is_fresh(entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();

        let evicted = expired
            .iter()
            .filter_map(|key| {
                self.entries
                    .remove_if(key, |_, grant| !self.is_fresh(grant, now))
                    .map(|(_, grant)| grant)
            })
            .collect();

        SweepOutcome {
            evicted,
            remaining: self.entries.len(),
        }
    }

    /// Report a grant's session calls upstream and fold them into the
    /// cached baseline. Returns the number of calls reported.
    pub async fn flush_usage(&self, grant: &AccessGrant) -> Result<u64, AppError> {
        let delta = grant.session_calls;
        if delta == 0 || grant.internal {
            return Ok(0);
        }

        self.authorization.update_usage(&grant.id, delta).await?;

        // Calls admitted while the update was in flight stay in the session
        // counter for the next flush. A grant refetched in the meantime
        // already carries the persisted count as its baseline.
        if let Some(mut entry) = self.entries.get_mut(&grant.access_id) {
            if entry.id == grant.id {
                if entry.cached_at == grant.cached_at {
                    entry.calls_per_period = entry.calls_per_period.saturating_add(delta);
                }
                entry.session_calls = entry.session_calls.saturating_sub(delta);
            }
        }
        Ok(delta)
    }

    /// Flush every cached grant with pending usage. Returns calls reported.
    pub async fn flush_all(&self) -> u64 {
        let pending: Vec<AccessGrant> = self
            .entries
            .iter()
            .filter(|entry| entry.session_calls > 0 && !entry.internal)
            .map(|entry| entry.value().clone())
            .collect();

        let mut reported = 0;
        for grant in pending {
            match self.flush_usage(&grant).await {
                Ok(delta) => reported += delta,
                Err(e) => {
                    warn!(access_id = %grant.access_id, error = %e, "Usage flush failed");
                }
            }
        }
        if reported > 0 {
            info!(calls = reported, "Usage flushed to authorization service");
        }
        reported
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GrantRecord;
    use crate::test_utils::MockAuthorizationService;

    fn record(access_id: &str, calls: u64, max: u64) -> GrantRecord {
        GrantRecord {
            id: format!("grant-{}", access_id),
            access_id: access_id.to_string(),
            blockchain_access: true,
            extended_methods: false,
            period_seconds: 3600,
            period_start: Utc::now(),
            calls_per_period: calls,
            max_calls_per_period: max,
        }
    }

    fn cache_with(
        auth: &Arc<MockAuthorizationService>,
        controller: Option<&str>,
    ) -> AccessControlCache {
        let config = AccessCacheConfig {
            lifetime: Duration::from_secs(60),
            controller_access_id: controller.map(str::to_string),
            ..Default::default()
        };
        AccessControlCache::new(Arc::clone(auth) as _, &config)
    }

    #[tokio::test]
    async fn test_resolve_hits_cache_after_first_fetch() {
        let auth = Arc::new(MockAuthorizationService::new());
        auth.insert(record("abc", 0, 10));
        let cache = cache_with(&auth, None);

        let first = cache.resolve("abc").await.unwrap();
        let second = cache.resolve("abc").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(auth.resolve_calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_grant_is_refetched_and_keeps_session_calls() {
        let auth = Arc::new(MockAuthorizationService::new());
        auth.insert(record("abc", 0, 10));
        let cache = cache_with(&auth, None);
        let start = Utc::now();

        let grant = cache.resolve_at("abc", start).await.unwrap();
        assert!(cache.admit(&grant, start));
        assert!(cache.admit(&grant, start));

        let later = start + TimeDelta::seconds(61);
        let refreshed = cache.resolve_at("abc", later).await.unwrap();
        assert_eq!(auth.resolve_calls(), 2);
        assert_eq!(refreshed.session_calls, 2);
    }

    #[tokio::test]
    async fn test_unknown_access_id_fails_closed() {
        let auth = Arc::new(MockAuthorizationService::new());
        let cache = cache_with(&auth, None);
        assert!(matches!(
            cache.resolve("nobody").await,
            Err(AppError::Authorization(_))
        ));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_service_fails_closed() {
        let auth = Arc::new(MockAuthorizationService::failing("connection refused"));
        auth.insert(record("abc", 0, 10));
        let cache = cache_with(&auth, None);
        assert!(matches!(
            cache.resolve("abc").await,
            Err(AppError::ExternalService(_))
        ));
    }

    #[tokio::test]
    async fn test_controller_bypasses_authorization_service() {
        let auth = Arc::new(MockAuthorizationService::failing("down"));
        let cache = cache_with(&auth, Some("controller"));

        let grant = cache.resolve("controller").await.unwrap();
        assert!(grant.internal);
        assert!(grant.blockchain_access && grant.extended_methods);
        assert_eq!(auth.resolve_calls(), 0);
    }

    #[tokio::test]
    async fn test_admit_counts_until_quota_exhausted() {
        let auth = Arc::new(MockAuthorizationService::new());
        auth.insert(record("abc", 7, 10));
        let cache = cache_with(&auth, None);
        let now = Utc::now();

        let grant = cache.resolve_at("abc", now).await.unwrap();
        assert!(cache.admit(&grant, now));
        assert!(cache.admit(&grant, now));
        assert!(cache.admit(&grant, now));
        // 7 persisted + 3 session == 10
        assert!(!cache.admit(&grant, now));
        assert_eq!(cache.peek("abc").unwrap().session_calls, 3);

        // Window rolls over: admitted again with the persisted count reset
        let next_window = now + TimeDelta::seconds(3600);
        assert!(cache.admit(&grant, next_window));
        let after = cache.peek("abc").unwrap();
        assert_eq!(after.calls_per_period, 0);
        assert_eq!(after.period_start, next_window);
    }

    #[tokio::test]
    async fn test_sweep_evicts_old_entries() {
        let auth = Arc::new(MockAuthorizationService::new());
        auth.insert(record("old", 0, 10));
        auth.insert(record("new", 0, 10));
        let cache = cache_with(&auth, None);
        let start = Utc::now();

        cache.resolve_at("old", start).await.unwrap();
        cache
            .resolve_at("new", start + TimeDelta::seconds(30))
            .await
            .unwrap();

        let outcome = cache.sweep_at(start + TimeDelta::seconds(60));
        assert_eq!(outcome.removed(), 1);
        assert_eq!(outcome.remaining, 1);
        assert_eq!(outcome.evicted[0].access_id, "old");
        assert!(cache.peek("new").is_some());
    }

    #[tokio::test]
    async fn test_flush_usage_folds_session_into_baseline() {
        let auth = Arc::new(MockAuthorizationService::new());
        auth.insert(record("abc", 2, 100));
        let cache = cache_with(&auth, None);
        let now = Utc::now();

        let grant = cache.resolve_at("abc", now).await.unwrap();
        for _ in 0..5 {
            assert!(cache.admit(&grant, now));
        }

        assert_eq!(cache.flush_all().await, 5);
        let flushed = cache.peek("abc").unwrap();
        assert_eq!(flushed.calls_per_period, 7);
        assert_eq!(flushed.session_calls, 0);
        assert_eq!(auth.usage_updates(), vec![("grant-abc".to_string(), 5)]);

        // Nothing pending: no second update
        assert_eq!(cache.flush_all().await, 0);
        assert_eq!(auth.usage_updates().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_after_refetch_does_not_count_twice() {
        let auth = Arc::new(MockAuthorizationService::new());
        auth.insert(record("abc", 0, 100));
        let cache = cache_with(&auth, None);
        let start = Utc::now();

        let grant = cache.resolve_at("abc", start).await.unwrap();
        for _ in 0..3 {
            assert!(cache.admit(&grant, start));
        }
        let pending = cache.peek("abc").unwrap();

        // The service already persisted the calls when the grant is refetched
        auth.insert(record("abc", 3, 100));
        let later = start + TimeDelta::seconds(61);
        cache.resolve_at("abc", later).await.unwrap();

        assert_eq!(cache.flush_usage(&pending).await.unwrap(), 3);
        let flushed = cache.peek("abc").unwrap();
        assert_eq!(flushed.calls_per_period, 3);
        assert_eq!(flushed.session_calls, 0);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_session_calls() {
        let auth = Arc::new(MockAuthorizationService::new());
        auth.insert(record("abc", 0, 100));
        let cache = cache_with(&auth, None);
        let now = Utc::now();

        let grant = cache.resolve_at("abc", now).await.unwrap();
        assert!(cache.admit(&grant, now));
        auth.set_failing(true);

        assert_eq!(cache.flush_all().await, 0);
        assert_eq!(cache.peek("abc").unwrap().session_calls, 1);
    }

    #[tokio::test]
    async fn test_internal_grant_is_never_flushed() {
        let auth = Arc::new(MockAuthorizationService::new());
        let cache = cache_with(&auth, Some("controller"));
        let now = Utc::now();

        let grant = cache.resolve_at("controller", now).await.unwrap();
        assert!(cache.admit(&grant, now));
        assert_eq!(cache.flush_all().await, 0);
        assert!(auth.usage_updates().is_empty());
    }
}
