//! Node list loading.
//!
//! The node list is a JSON array of `{"chain": ..., "url": ...}` objects,
//! read either from a file (`NODES_CONFIG`) or inline (`NODES`). Every entry
//! is validated; any invalid entry makes the whole list invalid.

use std::path::Path;

use reqwest::Url;
use tracing::info;
use validator::Validate;

use crate::domain::{ConfigError, NodeConfig};

/// Parse and validate an inline JSON node list
pub fn parse_node_configs(json: &str) -> Result<Vec<NodeConfig>, ConfigError> {
    let nodes: Vec<NodeConfig> =
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidValue {
            key: "NODES".to_string(),
            message: e.to_string(),
        })?;

    if nodes.is_empty() {
        return Err(ConfigError::EmptyNodeList);
    }

    for (index, node) in nodes.iter().enumerate() {
        node.validate()
            .map_err(|e| ConfigError::InvalidNode {
                index,
                message: e.to_string(),
            })?;
        validate_chain_name(&node.chain).map_err(|message| ConfigError::InvalidNode {
            index,
            message,
        })?;
        validate_endpoint(&node.url).map_err(|message| ConfigError::InvalidNode {
            index,
            message,
        })?;
    }

    Ok(nodes)
}

/// Read, parse and validate a node list file
pub fn load_node_configs(path: &Path) -> Result<Vec<NodeConfig>, ConfigError> {
    let json = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
        key: "NODES_CONFIG".to_string(),
        message: format!("{}: {}", path.display(), e),
    })?;
    let nodes = parse_node_configs(&json)?;
    info!(path = %path.display(), count = nodes.len(), "Node list loaded");
    Ok(nodes)
}

/// Chain names become URL path segments
fn validate_chain_name(chain: &str) -> Result<(), String> {
    let valid = chain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid && !chain.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "Chain name '{}' must be lowercase alphanumeric, '-' or '_'",
            chain
        ))
    }
}

fn validate_endpoint(url: &str) -> Result<(), String> {
    let parsed = Url::parse(url).map_err(|e| format!("Invalid URL '{}': {}", url, e))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(format!("Unsupported scheme '{}' in {}", other, url)),
    }
    if parsed.host_str().is_none() {
        return Err(format!("Missing host in {}", url));
    }
    Ok(())
}
