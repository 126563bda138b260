//! Domain types with validation support.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use validator::Validate;

/// Where a caller wants its request served from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Raw blockchain nodes behind the balancer
    #[default]
    Blockchain,
    /// Read-only SQL store for historical lookups
    Database,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blockchain => "blockchain",
            Self::Database => "database",
        }
    }
}

impl std::str::FromStr for DataSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blockchain" => Ok(Self::Blockchain),
            "database" => Ok(Self::Database),
            _ => Err(format!("Invalid data source: {}", s)),
        }
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One configured backend endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Chain name, used as the first path segment of proxied routes
    #[validate(length(min = 1, max = 64, message = "Chain name is required"))]
    pub chain: String,
    /// Full RPC endpoint URL of the node
    #[validate(url(message = "Node URL must be a valid URL"))]
    pub url: String,
}

impl NodeConfig {
    #[must_use]
    pub fn new(chain: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            url: url.into(),
        }
    }
}

/// Grant record as served by the authorization service
/// Longest accepted quota window, one hundred years
pub const MAX_PERIOD_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GrantRecord {
    /// Grant identifier used for usage updates
    #[validate(length(min = 1, message = "Grant id is required"))]
    pub id: String,
    /// Access identifier this grant belongs to
    #[validate(length(min = 1, message = "Access id is required"))]
    pub access_id: String,
    /// May reach raw blockchain nodes
    pub blockchain_access: bool,
    /// May call JSON-RPC methods outside the allow-list
    pub extended_methods: bool,
    /// Length of one quota window
    #[validate(range(
        min = 1,
        max = 3_153_600_000_i64,
        message = "Quota period must be between one second and one hundred years"
    ))]
    pub period_seconds: i64,
    /// Start of the current quota window
    pub period_start: DateTime<Utc>,
    /// Calls already accounted for in the current window
    pub calls_per_period: u64,
    /// Maximum calls admitted per window
    pub max_calls_per_period: u64,
}

/// Resolved authorization state cached for one access identifier
#[derive(Debug, Clone, PartialEq)]
pub struct AccessGrant {
    pub id: String,
    pub access_id: String,
    pub blockchain_access: bool,
    pub extended_methods: bool,
    pub period: TimeDelta,
    pub period_start: DateTime<Utc>,
    pub calls_per_period: u64,
    pub max_calls_per_period: u64,
    /// Calls admitted in this process and not yet flushed upstream
    pub session_calls: u64,
    pub last_access: DateTime<Utc>,
    pub cached_at: DateTime<Utc>,
    /// Hardcoded grant for the controller identity; never synced upstream
    pub internal: bool,
}

impl AccessGrant {
    /// Build a cacheable grant from a validated record
    #[must_use]
    pub fn from_record(record: GrantRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: record.id,
            access_id: record.access_id,
            blockchain_access: record.blockchain_access,
            extended_methods: record.extended_methods,
            period: TimeDelta::try_seconds(record.period_seconds).unwrap_or(TimeDelta::MAX),
            period_start: record.period_start,
            calls_per_period: record.calls_per_period,
            max_calls_per_period: record.max_calls_per_period,
            session_calls: 0,
            last_access: now,
            cached_at: now,
            internal: false,
        }
    }

    /// Full access with an effectively unlimited quota
    #[must_use]
    pub fn full_access(access_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: access_id.to_string(),
            access_id: access_id.to_string(),
            blockchain_access: true,
            extended_methods: true,
            period: TimeDelta::days(1),
            period_start: now,
            calls_per_period: 0,
            max_calls_per_period: u64::MAX,
            session_calls: 0,
            last_access: now,
            cached_at: now,
            internal: true,
        }
    }

    /// Quota gate. Rolls the window over when it has elapsed; never counts
    /// the call itself.
    pub fn check_quota(&mut self, now: DateTime<Utc>) -> bool {
        if now - self.period_start >= self.period {
            self.calls_per_period = 0;
            self.period_start = now;
            return true;
        }
        self.calls_per_period.saturating_add(self.session_calls) < self.max_calls_per_period
    }
}

/// A single JSON-RPC 2.0 call envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

/// Request body: one call or a batch of calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcPayload {
    Batch(Vec<JsonRpcRequest>),
    Single(JsonRpcRequest),
}

impl JsonRpcPayload {
    /// Every method named in the body, in order
    pub fn methods(&self) -> Vec<&str> {
        match self {
            Self::Single(call) => vec![call.method.as_str()],
            Self::Batch(calls) => calls.iter().map(|c| c.method.as_str()).collect(),
        }
    }
}

/// Parse a JSON-RPC hex quantity such as `0x1b4`
pub fn parse_hex_quantity(value: &str) -> Result<u64, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| format!("Missing 0x prefix: {}", value))?;
    if digits.is_empty() {
        return Err("Empty hex quantity".to_string());
    }
    u64::from_str_radix(digits, 16).map_err(|e| format!("Invalid hex quantity {}: {}", value, e))
}

/// Point-in-time view of one node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct NodeStatus {
    #[schema(example = "https://eth-node-1.internal:8545/")]
    pub endpoint: String,
    pub alive: bool,
    #[schema(example = 19_000_000)]
    pub height: u64,
    pub calls: u64,
}

/// All nodes of one chain
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChainStatus {
    #[schema(example = "eth")]
    pub chain: String,
    pub alive_nodes: usize,
    pub highest_block: u64,
    pub affinity_entries: usize,
    pub nodes: Vec<NodeStatus>,
}

/// Balancer status response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub chains: Vec<ChainStatus>,
    pub cached_grants: usize,
    pub timestamp: DateTime<Utc>,
    #[schema(example = "0.1.0")]
    pub version: String,
}

/// Liveness response of the balancer itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct PingResponse {
    #[schema(example = "ok")]
    pub status: String,
}

impl PingResponse {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// Periodic snapshot sent to the telemetry sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemReport {
    pub cached_grants: usize,
    pub affinity_entries: usize,
    pub alive_nodes: Vec<(String, usize)>,
    pub timestamp: DateTime<Utc>,
}

/// Error response structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error detail structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Error type identifier
    #[schema(example = "quota_exceeded")]
    pub r#type: String,
    /// Human-readable error message
    #[schema(example = "Quota exceeded for access id abc")]
    pub message: String,
}

/// Rate limit exceeded response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RateLimitResponse {
    /// Error details
    pub error: ErrorDetail,
    /// Seconds until rate limit resets
    #[schema(example = 1)]
    pub retry_after: u64,
}
