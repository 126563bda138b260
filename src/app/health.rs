//! Periodic node health checking.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::registry::{Node, NodeRegistry};
use crate::domain::TipProbe;

/// Default interval between health check rounds
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
/// Default per-node probe timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Configuration for the health checker
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl HealthCheckConfig {
    pub fn from_env() -> Self {
        use std::env;

        let interval = env::var("HEALTH_CHECK_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_INTERVAL);

        let timeout = env::var("HEALTH_CHECK_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);

        Self { interval, timeout }
    }
}

/// Outcome of one health check round
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckRound {
    pub alive: usize,
    pub dead: usize,
}

/// Probes every registered node and records liveness and height
pub struct HealthChecker {
    registry: Arc<NodeRegistry>,
    probe: Arc<dyn TipProbe>,
}

impl HealthChecker {
    #[must_use]
    pub fn new(registry: Arc<NodeRegistry>, probe: Arc<dyn TipProbe>) -> Self {
        Self { registry, probe }
    }

    /// Probe one node. A failed probe marks it dead with height zero.
    pub async fn check_node(&self, node: &Node) -> bool {
        check(self.probe.as_ref(), &self.registry, node).await
    }

    /// Probe every node concurrently; a slow node never delays the others
    pub async fn run_once(&self) -> CheckRound {
        let mut checks = JoinSet::new();
        for node in self.registry.all_nodes() {
            let node = Arc::clone(node);
            let probe = Arc::clone(&self.probe);
            let registry = Arc::clone(&self.registry);
            checks.spawn(async move { check(probe.as_ref(), &registry, &node).await });
        }

        let mut round = CheckRound::default();
        while let Some(result) = checks.join_next().await {
            match result {
                Ok(true) => round.alive += 1,
                Ok(false) => round.dead += 1,
                Err(e) => {
                    warn!(error = %e, "Health check task failed");
                    round.dead += 1;
                }
            }
        }
        round
    }
}

async fn check(probe: &dyn TipProbe, registry: &NodeRegistry, node: &Node) -> bool {
    match probe.latest_block_height(node.endpoint()).await {
        Ok(height) => {
            registry.mark_alive(node.endpoint(), node.chain(), height);
            debug!(chain = %node.chain(), endpoint = %node.endpoint(), height = height, "Node healthy");
            true
        }
        Err(e) => {
            warn!(
                chain = %node.chain(),
                endpoint = %node.endpoint(),
                error = %e,
                "Health check failed"
            );
            registry.mark_dead(node.endpoint(), node.chain());
            false
        }
    }
}

/// Spawn the health check loop. Send `true` on the returned channel to stop it.
pub fn spawn_health_checker(
    checker: Arc<HealthChecker>,
    config: HealthCheckConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        info!(interval_secs = config.interval.as_secs(), "Health checker started");
        let mut ticker = time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let round = checker.run_once().await;
                    debug!(alive = round.alive, dead = round.dead, "Health check round complete");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Health checker stopped");
    });

    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::NodeProxy;
    use crate::test_utils::MockTipProbe;
    use reqwest::{Client, Url};

    fn url(port: u16) -> Url {
        Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap()
    }

    fn registry(ports: &[u16]) -> Arc<NodeRegistry> {
        let mut registry = NodeRegistry::new();
        for port in ports {
            registry.add_node(Node::new(
                "test",
                NodeProxy::with_client(url(*port), Client::new()),
            ));
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_run_once_records_heights_and_failures() {
        let registry = registry(&[9000, 9001, 9002]);
        let probe = MockTipProbe::new();
        probe.set_height(&url(9000), 5);
        probe.set_height(&url(9001), 7);
        probe.set_failing(&url(9002));

        let checker = HealthChecker::new(Arc::clone(&registry), Arc::new(probe));
        let round = checker.run_once().await;
        assert_eq!(round, CheckRound { alive: 2, dead: 1 });

        let pool = registry.pool("test").unwrap();
        assert_eq!(pool.nodes()[0].liveness(), (true, 5));
        assert_eq!(pool.nodes()[1].liveness(), (true, 7));
        assert_eq!(pool.nodes()[2].liveness(), (false, 0));
        assert_eq!(pool.highest_block(), 7);
    }

    #[tokio::test]
    async fn test_recovered_node_comes_back() {
        let registry = registry(&[9000]);
        let probe = Arc::new(MockTipProbe::new());
        probe.set_failing(&url(9000));

        let checker = HealthChecker::new(Arc::clone(&registry), Arc::clone(&probe) as _);
        let node = Arc::clone(&registry.pool("test").unwrap().nodes()[0]);
        assert!(!checker.check_node(&node).await);
        assert!(!node.is_alive());

        probe.set_height(&url(9000), 42);
        assert!(checker.check_node(&node).await);
        assert_eq!(node.liveness(), (true, 42));
    }

    #[tokio::test]
    async fn test_spawned_checker_runs_and_stops() {
        let registry = registry(&[9000]);
        let probe = MockTipProbe::new();
        probe.set_height(&url(9000), 3);

        let checker = Arc::new(HealthChecker::new(Arc::clone(&registry), Arc::new(probe)));
        let config = HealthCheckConfig {
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(100),
        };
        let (handle, shutdown_tx) = spawn_health_checker(checker, config);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(registry.pool("test").unwrap().highest_block(), 3);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("checker did not stop")
            .unwrap();
    }
}
