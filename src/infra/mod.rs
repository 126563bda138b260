//! Infrastructure layer implementations.

pub mod authorization;
pub mod config;
pub mod probe;
pub mod proxy;
pub mod telemetry;

pub use authorization::HttpAuthorizationService;
pub use config::{load_node_configs, parse_node_configs};
pub use probe::RpcTipProbe;
pub use proxy::{NodeProxy, OutboundRequest, into_axum_response};
pub use telemetry::{HttpTelemetrySink, NoopTelemetrySink};
