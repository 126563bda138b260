//! Per-node reverse proxy.
//!
//! Each [`NodeProxy`] forwards a buffered [`OutboundRequest`] to exactly one
//! backend endpoint. The request is rewritten once on the way in (balancer
//! parameters and internal headers removed) so it can be replayed verbatim
//! on every retry; responses are rewritten on the way out (upstream CORS and
//! hop-by-hop headers removed).

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::response::Response;
use reqwest::header::{self, HeaderMap, HeaderName};
use reqwest::{Client, Method, Url};
use tracing::debug;

use crate::domain::{AppError, ConfigError, UpstreamError};

/// Query parameter carrying the caller identity
pub const ACCESS_ID_PARAM: &str = "access_id";
/// Query parameter selecting the routing mode
pub const DATA_SOURCE_PARAM: &str = "data_source";
/// Header carrying the caller identity
pub const ACCESS_ID_HEADER: &str = "x-access-id";
/// Header selecting the routing mode
pub const DATA_SOURCE_HEADER: &str = "x-data-source";

const BLOCK_NUMBER_CALL: &[u8] =
    br#"{"jsonrpc":"2.0","id":1,"method":"eth_blockNumber","params":[]}"#;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

fn is_cors(name: &HeaderName) -> bool {
    name.as_str().starts_with("access-control-")
}

/// Inbound request after the outbound rewrite, replayable across retries
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    /// Strip the balancer's own parameters and headers from an inbound
    /// request. `Host` is dropped so the client sets the upstream's host.
    #[must_use]
    pub fn from_inbound(
        method: Method,
        query: &[(String, String)],
        headers: &HeaderMap,
        body: Bytes,
    ) -> Self {
        let query = query
            .iter()
            .filter(|(key, _)| key != ACCESS_ID_PARAM && key != DATA_SOURCE_PARAM)
            .cloned()
            .collect();

        let mut forwarded = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            if *name == header::HOST
                || *name == header::CONTENT_LENGTH
                || name.as_str() == ACCESS_ID_HEADER
                || name.as_str() == DATA_SOURCE_HEADER
                || is_hop_by_hop(name)
            {
                continue;
            }
            forwarded.append(name.clone(), value.clone());
        }

        Self {
            method,
            query,
            headers: forwarded,
            body,
        }
    }

    /// Fixed `eth_blockNumber` call used for upstream status checks
    #[must_use]
    pub fn block_number() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        Self {
            method: Method::POST,
            query: Vec::new(),
            headers,
            body: Bytes::from_static(BLOCK_NUMBER_CALL),
        }
    }
}

/// Reverse proxy pointed at one backend endpoint
#[derive(Debug, Clone)]
pub struct NodeProxy {
    endpoint: Url,
    client: Client,
}

impl NodeProxy {
    /// Build a proxy with its own client bounded by `timeout`
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                AppError::Config(ConfigError::InvalidValue {
                    key: "PROXY_TIMEOUT_SECS".to_string(),
                    message: e.to_string(),
                })
            })?;
        Ok(Self::with_client(endpoint, client))
    }

    #[must_use]
    pub fn with_client(endpoint: Url, client: Client) -> Self {
        Self { endpoint, client }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Upstream URL for a request: the endpoint with the caller's remaining
    /// query parameters appended.
    #[must_use]
    pub fn target_url(&self, request: &OutboundRequest) -> Url {
        let mut url = self.endpoint.clone();
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &request.query {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    /// Send the request once. Any transport failure is returned to the
    /// dispatcher, which owns the retry policy.
    pub async fn send(&self, request: &OutboundRequest) -> Result<reqwest::Response, UpstreamError> {
        let url = self.target_url(request);
        debug!(endpoint = %self.endpoint, method = %request.method, "Forwarding request");

        let response = self
            .client
            .request(request.method.clone(), url)
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send()
            .await?;
        Ok(response)
    }
}

/// Convert an upstream response into the balancer's response, streaming the
/// body and dropping CORS and hop-by-hop headers.
pub fn into_axum_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = HeaderMap::with_capacity(upstream.headers().len());
    for (name, value) in upstream.headers() {
        if is_cors(name) || is_hop_by_hop(name) || *name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
