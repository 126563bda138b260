//! Request routing: access control, quota, node choice and dispatch.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::access::AccessControlCache;
use super::affinity::AffinityCaches;
use super::dispatcher::{Dispatcher, ProxyContext};
use super::registry::{Node, NodeRegistry};
use crate::domain::{
    AccessGrant, AppError, ChainStatus, DataSource, JsonRpcPayload, StatusResponse,
    UpstreamError, ValidationError,
};
use crate::infra::OutboundRequest;

/// Methods every grant with blockchain access may call
pub const DEFAULT_ALLOWED_METHODS: &[&str] = &[
    "eth_blockNumber",
    "eth_call",
    "eth_chainId",
    "eth_estimateGas",
    "eth_feeHistory",
    "eth_gasPrice",
    "eth_getBalance",
    "eth_getBlockByHash",
    "eth_getBlockByNumber",
    "eth_getBlockTransactionCountByHash",
    "eth_getBlockTransactionCountByNumber",
    "eth_getCode",
    "eth_getLogs",
    "eth_getStorageAt",
    "eth_getTransactionByBlockHashAndIndex",
    "eth_getTransactionByBlockNumberAndIndex",
    "eth_getTransactionByHash",
    "eth_getTransactionCount",
    "eth_getTransactionReceipt",
    "eth_maxPriorityFeePerGas",
    "eth_sendRawTransaction",
    "eth_syncing",
    "net_version",
    "web3_clientVersion",
];

/// Allow-list of JSON-RPC methods; anything else needs extended access
#[derive(Debug, Clone)]
pub struct MethodPolicy {
    allowed: HashSet<String>,
}

impl Default for MethodPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_METHODS.iter().copied())
    }
}

impl MethodPolicy {
    #[must_use]
    pub fn new<'a>(methods: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            allowed: methods.into_iter().map(str::to_string).collect(),
        }
    }

    /// `ALLOWED_METHODS` as a comma-separated list, or the default list
    pub fn from_env() -> Self {
        match std::env::var("ALLOWED_METHODS") {
            Ok(list) if !list.trim().is_empty() => {
                Self::new(list.split(',').map(str::trim).filter(|m| !m.is_empty()))
            }
            _ => Self::default(),
        }
    }

    #[must_use]
    pub fn is_allowed(&self, method: &str) -> bool {
        self.allowed.contains(method)
    }

    /// First method in `payload` outside the allow-list
    #[must_use]
    pub fn first_disallowed<'a>(&self, payload: &'a JsonRpcPayload) -> Option<&'a str> {
        payload.methods().into_iter().find(|m| !self.is_allowed(m))
    }
}

/// Caller-supplied routing parameters, after query/header precedence
#[derive(Debug, Clone, Default)]
pub struct CallerParams {
    pub access_id: Option<String>,
    pub data_source: Option<String>,
}

/// Application service routing proxied requests
pub struct AppService {
    registry: Arc<NodeRegistry>,
    affinity: Arc<AffinityCaches>,
    access: Arc<AccessControlCache>,
    dispatcher: Arc<Dispatcher>,
    methods: MethodPolicy,
}

impl AppService {
    #[must_use]
    pub fn new(
        registry: Arc<NodeRegistry>,
        affinity: Arc<AffinityCaches>,
        access: Arc<AccessControlCache>,
        dispatcher: Arc<Dispatcher>,
        methods: MethodPolicy,
    ) -> Self {
        Self {
            registry,
            affinity,
            access,
            dispatcher,
            methods,
        }
    }

    /// Route one inbound request to a node of `chain` and return the
    /// upstream response.
    #[instrument(skip(self, caller, request), fields(access_id = caller.access_id.as_deref().unwrap_or("-")))]
    pub async fn route(
        &self,
        chain: &str,
        caller: &CallerParams,
        request: &OutboundRequest,
        original_path: &str,
    ) -> Result<reqwest::Response, AppError> {
        let (access_id, grant) = self.caller_grant(chain, caller).await?;

        self.authorize(&grant, request)?;

        if !self.access.admit(&grant, Utc::now()) {
            warn!(access_id = %access_id, "Quota exceeded");
            return Err(AppError::QuotaExceeded(access_id.to_string()));
        }

        self.dispatch(chain, access_id, request, original_path).await
    }

    /// Lightweight upstream status check for `chain`. The caller needs
    /// blockchain access but the call is not charged to its quota, and the
    /// node receives a fixed `eth_blockNumber` call whatever the caller sent.
    #[instrument(skip(self, caller), fields(access_id = caller.access_id.as_deref().unwrap_or("-")))]
    pub async fn ping(
        &self,
        chain: &str,
        caller: &CallerParams,
        original_path: &str,
    ) -> Result<reqwest::Response, AppError> {
        let (access_id, grant) = self.caller_grant(chain, caller).await?;
        check_blockchain_access(&grant)?;
        self.dispatch(chain, access_id, &OutboundRequest::block_number(), original_path)
            .await
    }

    /// Chain, caller identity, data source and grant, in that order
    async fn caller_grant<'a>(
        &self,
        chain: &str,
        caller: &'a CallerParams,
    ) -> Result<(&'a str, AccessGrant), AppError> {
        if !self.registry.has_chain(chain) {
            return Err(ValidationError::UnknownChain(chain.to_string()).into());
        }

        let access_id = caller
            .access_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::Authentication("Missing access id".to_string()))?;

        let data_source = match caller.data_source.as_deref() {
            None | Some("") => DataSource::default(),
            Some(raw) => raw
                .parse::<DataSource>()
                .map_err(|_| ValidationError::UnknownDataSource(raw.to_string()))?,
        };

        let grant = self.access.resolve(access_id).await?;

        if data_source == DataSource::Database {
            return Err(AppError::NotSupported(
                "Database data source is under development".to_string(),
            ));
        }

        Ok((access_id, grant))
    }

    async fn dispatch(
        &self,
        chain: &str,
        access_id: &str,
        request: &OutboundRequest,
        original_path: &str,
    ) -> Result<reqwest::Response, AppError> {
        let node = self.choose_node(chain, access_id)?;
        let mut ctx = ProxyContext::new(original_path);
        debug!(request_id = %ctx.request_id, endpoint = %node.endpoint(), "Dispatching");

        let registry = &self.registry;
        let affinity = self.affinity.for_chain(chain);
        self.dispatcher
            .forward(chain, node, request, &mut ctx, || {
                let next = registry.select_node(chain)?;
                if let Some(cache) = affinity {
                    cache.put(access_id, Arc::clone(&next));
                }
                Some(next)
            })
            .await
    }

    /// Blockchain access plus the method allow-list. One disallowed call
    /// rejects the whole batch.
    fn authorize(&self, grant: &AccessGrant, request: &OutboundRequest) -> Result<(), AppError> {
        check_blockchain_access(grant)?;

        if request.body.is_empty() {
            return Ok(());
        }

        let payload: JsonRpcPayload = serde_json::from_slice(&request.body)
            .map_err(|e| ValidationError::MalformedBody(e.to_string()))?;

        if grant.extended_methods {
            return Ok(());
        }
        match self.methods.first_disallowed(&payload) {
            Some(method) => Err(AppError::Authorization(format!(
                "Method {} requires extended access",
                method
            ))),
            None => Ok(()),
        }
    }

    /// Pinned node if still alive, otherwise a fresh selection. The choice
    /// is recorded back into the affinity cache.
    fn choose_node(&self, chain: &str, caller_id: &str) -> Result<Arc<Node>, AppError> {
        let cache = self.affinity.for_chain(chain);

        let pinned = cache.and_then(|c| c.get(caller_id));
        let node = match pinned {
            Some(node) if node.is_alive() => node,
            stale => {
                if stale.is_some() {
                    info!(caller = %caller_id, "Pinned node is dead, reselecting");
                }
                self.registry
                    .select_node(chain)
                    .ok_or_else(|| UpstreamError::NoAvailableNode(chain.to_string()))?
            }
        };

        if let Some(cache) = cache {
            cache.put(caller_id, Arc::clone(&node));
        }
        Ok(node)
    }

    /// Node fleet and cache snapshot
    #[must_use]
    pub fn status(&self) -> StatusResponse {
        let chains = self
            .registry
            .chains()
            .into_iter()
            .filter_map(|chain| {
                let pool = self.registry.pool(chain)?;
                let nodes: Vec<_> = pool.nodes().iter().map(|n| n.status()).collect();
                Some(ChainStatus {
                    chain: chain.to_string(),
                    alive_nodes: nodes.iter().filter(|n| n.alive).count(),
                    highest_block: pool.highest_block(),
                    affinity_entries: self.affinity.for_chain(chain).map_or(0, |c| c.len()),
                    nodes,
                })
            })
            .collect();

        StatusResponse {
            chains,
            cached_grants: self.access.len(),
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn check_blockchain_access(grant: &AccessGrant) -> Result<(), AppError> {
    if grant.blockchain_access {
        Ok(())
    } else {
        Err(AppError::Authorization(format!(
            "Access id {} has no blockchain access",
            grant.access_id
        )))
    }
}
