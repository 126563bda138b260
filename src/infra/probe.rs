//! Chain-tip probe used by the health checker.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::domain::{AppError, ConfigError, TipProbe, UpstreamError, parse_hex_quantity};

/// Default per-node probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Serialize)]
struct JsonRpcCall {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcReply {
    result: Option<BlockHeader>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    number: String,
}

/// Queries `eth_getBlockByNumber("latest", false)` on a node
#[derive(Debug, Clone)]
pub struct RpcTipProbe {
    http_client: Client,
    timeout: Duration,
}

impl Default for RpcTipProbe {
    fn default() -> Self {
        Self {
            http_client: Client::new(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl RpcTipProbe {
    /// Probe with a bounded timeout applied to every single check
    pub fn new(timeout: Duration) -> Result<Self, AppError> {
        let http_client = Client::builder().timeout(timeout).build().map_err(|e| {
            AppError::Config(ConfigError::InvalidValue {
                key: "HEALTH_CHECK_TIMEOUT_MS".to_string(),
                message: e.to_string(),
            })
        })?;
        Ok(Self {
            http_client,
            timeout,
        })
    }
}

#[async_trait]
impl TipProbe for RpcTipProbe {
    #[instrument(skip(self), fields(endpoint = %endpoint))]
    async fn latest_block_height(&self, endpoint: &Url) -> Result<u64, AppError> {
        let call = JsonRpcCall {
            jsonrpc: "2.0",
            id: 1,
            method: "eth_getBlockByNumber",
            params: json!(["latest", false]),
        };

        let response = self
            .http_client
            .post(endpoint.clone())
            .timeout(self.timeout)
            .json(&call)
            .send()
            .await
            .map_err(UpstreamError::from)?;

        if !response.status().is_success() {
            return Err(UpstreamError::MalformedResponse(format!(
                "HTTP status {}",
                response.status()
            ))
            .into());
        }

        let reply: JsonRpcReply = response.json().await.map_err(UpstreamError::from)?;
        if let Some(error) = reply.error {
            return Err(UpstreamError::MalformedResponse(format!("RPC error: {}", error)).into());
        }
        let header = reply
            .result
            .ok_or_else(|| UpstreamError::MalformedResponse("Missing result".to_string()))?;
        let height =
            parse_hex_quantity(&header.number).map_err(UpstreamError::MalformedResponse)?;

        debug!(height = height, "Chain tip observed");
        Ok(height)
    }
}
