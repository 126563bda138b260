//! Application layer containing routing logic, caches and shared state.

pub mod access;
pub mod affinity;
pub mod dispatcher;
pub mod health;
pub mod maintenance;
pub mod registry;
pub mod service;
pub mod state;

pub use access::{AccessCacheConfig, AccessControlCache, SweepOutcome};
pub use affinity::{AffinityCaches, AffinityConfig, ClientAffinityCache};
pub use dispatcher::{Dispatcher, ProxyContext, RetryPolicy};
pub use health::{HealthCheckConfig, HealthChecker, spawn_health_checker};
pub use maintenance::{
    run_access_maintenance, spawn_access_maintenance, spawn_affinity_sweeper, system_report,
};
pub use registry::{Node, NodePool, NodeRegistry};
pub use service::{AppService, CallerParams, MethodPolicy};
pub use state::AppState;
