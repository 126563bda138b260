//! Node registry and tip-preferring round-robin selection.
//!
//! Pools are built once at startup and never shrink. Each node guards its
//! liveness, height and call counter with its own mutex so the
//! liveness/height pair is always read and written together. The pool's
//! fairness counter is a plain atomic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use reqwest::Url;
use tracing::{info, warn};

use crate::domain::NodeStatus;
use crate::infra::NodeProxy;

/// Call counters wrap back to zero at this bound
pub const CALL_COUNTER_RESET: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, Default)]
struct NodeState {
    alive: bool,
    height: u64,
    calls: u64,
}

/// One backend RPC endpoint of one chain
#[derive(Debug)]
pub struct Node {
    chain: String,
    proxy: NodeProxy,
    state: Mutex<NodeState>,
}

impl Node {
    /// New nodes start alive at height zero until the first health check
    #[must_use]
    pub fn new(chain: impl Into<String>, proxy: NodeProxy) -> Self {
        Self {
            chain: chain.into(),
            proxy,
            state: Mutex::new(NodeState {
                alive: true,
                height: 0,
                calls: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        // The state is plain data; a poisoned lock still holds a usable value.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn chain(&self) -> &str {
        &self.chain
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        self.proxy.endpoint()
    }

    #[must_use]
    pub fn proxy(&self) -> &NodeProxy {
        &self.proxy
    }

    /// Liveness and height, read under one lock
    #[must_use]
    pub fn liveness(&self) -> (bool, u64) {
        let state = self.state();
        (state.alive, state.height)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state().alive
    }

    #[must_use]
    pub fn height(&self) -> u64 {
        self.state().height
    }

    pub fn set_alive(&self, height: u64) {
        let mut state = self.state();
        state.alive = true;
        state.height = height;
    }

    /// Dead nodes also lose their height so they never define the tip
    pub fn set_dead(&self) {
        let mut state = self.state();
        state.alive = false;
        state.height = 0;
    }

    /// Count one dispatched call
    pub fn record_call(&self) -> u64 {
        let mut state = self.state();
        state.calls = if state.calls + 1 >= CALL_COUNTER_RESET {
            0
        } else {
            state.calls + 1
        };
        state.calls
    }

    #[must_use]
    pub fn status(&self) -> NodeStatus {
        let state = *self.state();
        NodeStatus {
            endpoint: self.endpoint().to_string(),
            alive: state.alive,
            height: state.height,
            calls: state.calls,
        }
    }
}

/// All nodes serving one chain
#[derive(Debug, Default)]
pub struct NodePool {
    nodes: Vec<Arc<Node>>,
    counter: AtomicU64,
}

impl NodePool {
    #[must_use]
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Highest observed height; unknown heights count as zero
    #[must_use]
    pub fn highest_block(&self) -> u64 {
        self.nodes.iter().map(|n| n.height()).max().unwrap_or(0)
    }

    /// Pick a node for a fresh request.
    ///
    /// Starts at `counter % len` and scans the whole pool once, returning
    /// the first alive node at the tip. Alive nodes that lag are skipped
    /// for this call only. The tip and the choice come from one snapshot
    /// of every node, so a concurrent `mark_dead` can never leave the scan
    /// without a candidate while alive nodes remain.
    #[must_use]
    pub fn select(&self) -> Option<Arc<Node>> {
        if self.nodes.is_empty() {
            return None;
        }
        let snapshot: Vec<(bool, u64)> = self.nodes.iter().map(|n| n.liveness()).collect();
        let highest = snapshot
            .iter()
            .filter(|(alive, _)| *alive)
            .map(|(_, height)| *height)
            .max()?;
        let len = self.nodes.len();
        let start = (self.counter.fetch_add(1, Ordering::Relaxed) % len as u64) as usize;

        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&i| {
                let (alive, height) = snapshot[i];
                alive && height >= highest
            })
            .map(|i| Arc::clone(&self.nodes[i]))
    }

    fn find(&self, endpoint: &Url) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.endpoint() == endpoint)
    }
}

/// Per-chain node pools
#[derive(Debug, Default)]
pub struct NodeRegistry {
    pools: HashMap<String, NodePool>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node to its chain's pool. No deduplication is done.
    pub fn add_node(&mut self, node: Node) -> Arc<Node> {
        let node = Arc::new(node);
        info!(chain = %node.chain(), endpoint = %node.endpoint(), "Node registered");
        self.pools
            .entry(node.chain().to_string())
            .or_default()
            .nodes
            .push(Arc::clone(&node));
        node
    }

    #[must_use]
    pub fn pool(&self, chain: &str) -> Option<&NodePool> {
        self.pools.get(chain)
    }

    #[must_use]
    pub fn has_chain(&self, chain: &str) -> bool {
        self.pools.contains_key(chain)
    }

    /// Chain names in stable order
    #[must_use]
    pub fn chains(&self) -> Vec<&str> {
        let mut chains: Vec<&str> = self.pools.keys().map(String::as_str).collect();
        chains.sort_unstable();
        chains
    }

    /// Every node of every chain
    pub fn all_nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.pools.values().flat_map(|pool| pool.nodes.iter())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.values().all(NodePool::is_empty)
    }

    #[must_use]
    pub fn select_node(&self, chain: &str) -> Option<Arc<Node>> {
        self.pools.get(chain)?.select()
    }

    /// Returns `false` when no node of `chain` has that endpoint
    pub fn mark_dead(&self, endpoint: &Url, chain: &str) -> bool {
        match self.pools.get(chain).and_then(|pool| pool.find(endpoint)) {
            Some(node) => {
                if node.is_alive() {
                    warn!(chain = %chain, endpoint = %endpoint, "Node marked dead");
                }
                node.set_dead();
                true
            }
            None => false,
        }
    }

    /// Returns `false` when no node of `chain` has that endpoint
    pub fn mark_alive(&self, endpoint: &Url, chain: &str, height: u64) -> bool {
        match self.pools.get(chain).and_then(|pool| pool.find(endpoint)) {
            Some(node) => {
                if !node.is_alive() {
                    info!(chain = %chain, endpoint = %endpoint, height = height, "Node back alive");
                }
                node.set_alive(height);
                true
            }
            None => false,
        }
    }

    /// Alive node count per chain
    #[must_use]
    pub fn alive_counts(&self) -> Vec<(String, usize)> {
        self.chains()
            .into_iter()
            .map(|chain| {
                let alive = self.pools[chain]
                    .nodes
                    .iter()
                    .filter(|n| n.is_alive())
                    .count();
                (chain.to_string(), alive)
            })
            .collect()
    }
}
