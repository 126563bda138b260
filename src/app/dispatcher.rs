//! Retrying dispatcher.
//!
//! Two nested bounds: `max_retries` resends to the same node, then the node
//! is marked dead and the request fails over to a freshly selected node, up
//! to `max_attempts` distinct nodes. At most
//! `max_attempts * (1 + max_retries)` sends are made per request.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::registry::{Node, NodeRegistry};
use crate::domain::{AppError, UpstreamError};
use crate::infra::OutboundRequest;

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry and failover bounds
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Resends to the same node after its first failure
    pub max_retries: u32,
    /// Distinct nodes tried, including the first
    pub max_attempts: u32,
    /// Fixed sleep before each same-node resend
    pub backoff: Duration,
    /// Timeout of a single proxied call
    pub proxy_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            proxy_timeout: DEFAULT_PROXY_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        use std::env;

        let max_retries = env::var("PROXY_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let max_attempts = env::var("PROXY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &u32| *v > 0)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        let backoff = env::var("PROXY_RETRY_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BACKOFF);

        let proxy_timeout = env::var("PROXY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PROXY_TIMEOUT);

        Self {
            max_retries,
            max_attempts,
            backoff,
            proxy_timeout,
        }
    }

    /// Upper bound on sends for a single request
    #[must_use]
    pub fn max_sends(&self) -> u32 {
        self.max_attempts * (1 + self.max_retries)
    }
}

/// Request-scoped dispatch state
#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub request_id: Uuid,
    /// Path the caller hit, kept for logs across failovers
    pub original_path: String,
    /// Nodes given up on so far
    pub attempts: u32,
    /// Resends to the current node
    pub retries: u32,
    pub total_retries: u32,
}

impl ProxyContext {
    #[must_use]
    pub fn new(original_path: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            original_path: original_path.into(),
            attempts: 0,
            retries: 0,
            total_retries: 0,
        }
    }
}

/// Forwards requests to nodes with bounded retry and failover
pub struct Dispatcher {
    registry: Arc<NodeRegistry>,
    policy: RetryPolicy,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<NodeRegistry>, policy: RetryPolicy) -> Self {
        Self { registry, policy }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Forward `request` to `node`, failing over through `reselect` when a
    /// node exhausts its retries. `reselect` is called after the failed node
    /// has been marked dead.
    #[instrument(
        skip(self, node, request, ctx, reselect),
        fields(request_id = %ctx.request_id, path = %ctx.original_path)
    )]
    pub async fn forward<F>(
        &self,
        chain: &str,
        mut node: Arc<Node>,
        request: &OutboundRequest,
        ctx: &mut ProxyContext,
        mut reselect: F,
    ) -> Result<reqwest::Response, AppError>
    where
        F: FnMut() -> Option<Arc<Node>> + Send,
    {
        loop {
            let error = match self.send_with_retries(&node, request, ctx).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            self.registry.mark_dead(node.endpoint(), chain);
            ctx.attempts += 1;
            warn!(
                endpoint = %node.endpoint(),
                attempts = ctx.attempts,
                error = %error,
                "Node failed, failing over"
            );

            if ctx.attempts >= self.policy.max_attempts {
                return Err(UpstreamError::AttemptsExhausted {
                    chain: chain.to_string(),
                    attempts: ctx.attempts,
                }
                .into());
            }

            node = reselect().ok_or_else(|| UpstreamError::NoAvailableNode(chain.to_string()))?;
        }
    }

    async fn send_with_retries(
        &self,
        node: &Node,
        request: &OutboundRequest,
        ctx: &mut ProxyContext,
    ) -> Result<reqwest::Response, UpstreamError> {
        ctx.retries = 0;
        loop {
            node.record_call();
            match node.proxy().send(request).await {
                Ok(response) => {
                    debug!(
                        endpoint = %node.endpoint(),
                        status = %response.status(),
                        retries = ctx.retries,
                        "Upstream responded"
                    );
                    return Ok(response);
                }
                Err(e) if ctx.retries < self.policy.max_retries => {
                    debug!(endpoint = %node.endpoint(), retry = ctx.retries + 1, error = %e, "Retrying");
                    tokio::time::sleep(self.policy.backoff).await;
                    ctx.retries += 1;
                    ctx.total_retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
