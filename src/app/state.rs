//! Application state management.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{AuthorizationService, TelemetrySink};
use crate::infra::NoopTelemetrySink;

use super::access::{AccessCacheConfig, AccessControlCache};
use super::affinity::AffinityCaches;
use super::dispatcher::{Dispatcher, RetryPolicy};
use super::registry::NodeRegistry;
use super::service::{AppService, MethodPolicy};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AppService>,
    pub registry: Arc<NodeRegistry>,
    pub affinity: Arc<AffinityCaches>,
    pub access: Arc<AccessControlCache>,
    pub dispatcher: Arc<Dispatcher>,
    /// Receives panic and periodic system reports
    pub telemetry: Arc<dyn TelemetrySink>,
    methods: MethodPolicy,
}

impl AppState {
    /// Create a new application state with default cache and retry settings
    #[must_use]
    pub fn new(registry: NodeRegistry, authorization: Arc<dyn AuthorizationService>) -> Self {
        let registry = Arc::new(registry);
        let affinity = Arc::new(AffinityCaches::new(
            registry.chains(),
            super::affinity::DEFAULT_KEEP_ALIVE,
        ));
        let access = Arc::new(AccessControlCache::new(
            authorization,
            &AccessCacheConfig::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            RetryPolicy::default(),
        ));
        let methods = MethodPolicy::default();
        let service = Arc::new(AppService::new(
            Arc::clone(&registry),
            Arc::clone(&affinity),
            Arc::clone(&access),
            Arc::clone(&dispatcher),
            methods.clone(),
        ));

        Self {
            service,
            registry,
            affinity,
            access,
            dispatcher,
            telemetry: Arc::new(NoopTelemetrySink),
            methods,
        }
    }

    fn rebuild_service(mut self) -> Self {
        self.service = Arc::new(AppService::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.affinity),
            Arc::clone(&self.access),
            Arc::clone(&self.dispatcher),
            self.methods.clone(),
        ));
        self
    }

    /// Replace the affinity caches with ones using `keep_alive` (builder pattern)
    #[must_use]
    pub fn with_affinity_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.affinity = Arc::new(AffinityCaches::new(self.registry.chains(), keep_alive));
        self.rebuild_service()
    }

    /// Replace the access cache (builder pattern)
    #[must_use]
    pub fn with_access_cache(mut self, access: Arc<AccessControlCache>) -> Self {
        self.access = access;
        self.rebuild_service()
    }

    /// Replace the retry policy (builder pattern)
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.dispatcher = Arc::new(Dispatcher::new(Arc::clone(&self.registry), policy));
        self.rebuild_service()
    }

    /// Replace the method allow-list (builder pattern)
    #[must_use]
    pub fn with_method_policy(mut self, methods: MethodPolicy) -> Self {
        self.methods = methods;
        self.rebuild_service()
    }

    /// Add a telemetry sink (builder pattern)
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }
}
