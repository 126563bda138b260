//! Sticky, health-aware JSON-RPC load balancer for blockchain node fleets.

pub mod api;
pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
