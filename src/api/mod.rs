//! The API layer, containing web handlers and routing.

pub mod handlers;
pub mod router;

pub use handlers::{ApiDoc, chain_ping_handler, ping_handler, proxy_handler, status_handler};
pub use router::{RateLimitConfig, create_router, create_router_with_rate_limit};
