//! Client affinity cache.
//!
//! Keeps a caller on the node it was last routed to for as long as it keeps
//! calling within the keep-alive window, so it reads back its own writes
//! (nonces, pending transactions) from the same node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use super::registry::Node;

/// Default keep-alive window
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Default sweep interval
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(120);

/// Affinity settings shared by every chain's cache
#[derive(Debug, Clone)]
pub struct AffinityConfig {
    pub keep_alive: Duration,
    pub sweep_interval: Duration,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl AffinityConfig {
    pub fn from_env() -> Self {
        use std::env;

        let keep_alive = env::var("AFFINITY_KEEP_ALIVE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_KEEP_ALIVE);

        let sweep_interval = env::var("AFFINITY_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL);

        Self {
            keep_alive,
            sweep_interval,
        }
    }
}

#[derive(Debug, Clone)]
struct AffinityEntry {
    node: Arc<Node>,
    last_call: Instant,
}

/// Caller identity to pinned node, for one chain
#[derive(Debug)]
pub struct ClientAffinityCache {
    keep_alive: Duration,
    entries: Mutex<HashMap<String, AffinityEntry>>,
}

impl ClientAffinityCache {
    #[must_use]
    pub fn new(keep_alive: Duration) -> Self {
        Self {
            keep_alive,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, AffinityEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    #[must_use]
    pub fn get(&self, caller_id: &str) -> Option<Arc<Node>> {
        self.get_at(caller_id, Instant::now())
    }

    /// Pinned node for `caller_id`, refreshing the entry. Expired entries
    /// are removed on the spot.
    #[must_use]
    pub fn get_at(&self, caller_id: &str, now: Instant) -> Option<Arc<Node>> {
        let mut entries = self.entries();
        let entry = entries.get_mut(caller_id)?;
        if now.saturating_duration_since(entry.last_call) < self.keep_alive {
            entry.last_call = now;
            return Some(Arc::clone(&entry.node));
        }
        entries.remove(caller_id);
        debug!(caller = %caller_id, "Affinity expired");
        None
    }

    pub fn put(&self, caller_id: &str, node: Arc<Node>) {
        self.put_at(caller_id, node, Instant::now());
    }

    pub fn put_at(&self, caller_id: &str, node: Arc<Node>, now: Instant) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(caller_id) {
            if Arc::ptr_eq(&entry.node, &node) {
                entry.last_call = now;
                return;
            }
        }
        entries.insert(
            caller_id.to_string(),
            AffinityEntry {
                node,
                last_call: now,
            },
        );
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Remove expired entries; returns how many survive
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries();
        entries.retain(|_, entry| now.saturating_duration_since(entry.last_call) < self.keep_alive);
        entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// One affinity cache per chain
#[derive(Debug, Default)]
pub struct AffinityCaches {
    caches: HashMap<String, ClientAffinityCache>,
}

impl AffinityCaches {
    #[must_use]
    pub fn new<'a>(chains: impl IntoIterator<Item = &'a str>, keep_alive: Duration) -> Self {
        let caches = chains
            .into_iter()
            .map(|chain| (chain.to_string(), ClientAffinityCache::new(keep_alive)))
            .collect();
        Self { caches }
    }

    #[must_use]
    pub fn for_chain(&self, chain: &str) -> Option<&ClientAffinityCache> {
        self.caches.get(chain)
    }

    /// Sweep every chain; returns total surviving entries
    pub fn sweep_all(&self) -> usize {
        self.caches.values().map(ClientAffinityCache::sweep).sum()
    }

    #[must_use]
    pub fn total_entries(&self) -> usize {
        self.caches.values().map(ClientAffinityCache::len).sum()
    }
}
