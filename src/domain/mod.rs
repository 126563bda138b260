//! Domain layer containing core types, traits, and error definitions.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{AppError, ConfigError, ExternalServiceError, UpstreamError, ValidationError};
pub use traits::{AuthorizationService, TelemetrySink, TipProbe};
pub use types::{
    AccessGrant, ChainStatus, DataSource, ErrorDetail, ErrorResponse, GrantRecord,
    JsonRpcPayload, JsonRpcRequest, NodeConfig, NodeStatus, PingResponse, RateLimitResponse,
    StatusResponse, SystemReport, parse_hex_quantity,
};
