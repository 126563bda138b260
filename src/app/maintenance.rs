//! Cache maintenance loops.
//!
//! The affinity sweep and the access cache sweep run on independent tickers.
//! Each tick of the access loop also reconciles usage with the authorization
//! service and sends a system report to telemetry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::access::AccessControlCache;
use super::affinity::AffinityCaches;
use super::registry::NodeRegistry;
use crate::domain::{SystemReport, TelemetrySink};

/// Snapshot sent to the telemetry sink
#[must_use]
pub fn system_report(
    registry: &NodeRegistry,
    affinity: &AffinityCaches,
    access: &AccessControlCache,
) -> SystemReport {
    SystemReport {
        cached_grants: access.len(),
        affinity_entries: affinity.total_entries(),
        alive_nodes: registry.alive_counts(),
        timestamp: Utc::now(),
    }
}

/// Spawn the affinity sweep loop
pub fn spawn_affinity_sweeper(
    affinity: Arc<AffinityCaches>,
    interval: Duration,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; nothing to sweep yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let remaining = affinity.sweep_all();
                    debug!(remaining = remaining, "Affinity caches swept");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Affinity sweeper stopped");
    });

    (handle, shutdown_tx)
}

/// One pass of access cache maintenance: flush pending usage, evict old
/// grants (flushing whatever they still carry) and report.
pub async fn run_access_maintenance(
    access: &AccessControlCache,
    registry: &NodeRegistry,
    affinity: &AffinityCaches,
    telemetry: &dyn TelemetrySink,
) {
    access.flush_all().await;

    let outcome = access.sweep();
    for grant in &outcome.evicted {
        if let Err(e) = access.flush_usage(grant).await {
            warn!(
                access_id = %grant.access_id,
                calls = grant.session_calls,
                error = %e,
                "Dropping usage of evicted grant"
            );
        }
    }
    debug!(
        removed = outcome.removed(),
        remaining = outcome.remaining,
        "Access cache swept"
    );

    telemetry.report_system(system_report(registry, affinity, access));
}

/// Spawn the access cache maintenance loop
pub fn spawn_access_maintenance(
    access: Arc<AccessControlCache>,
    registry: Arc<NodeRegistry>,
    affinity: Arc<AffinityCaches>,
    telemetry: Arc<dyn TelemetrySink>,
    interval: Duration,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_access_maintenance(&access, &registry, &affinity, telemetry.as_ref()).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        // Push whatever was admitted since the last tick
        access.flush_all().await;
        info!("Access cache maintenance stopped");
    });

    (handle, shutdown_tx)
}
