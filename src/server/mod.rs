//! Server module
//!
//! Router, middleware, error sanitizing, and startup for the image proxy.

pub mod errors;
pub mod headers;
pub mod http;
pub mod ratelimit;
pub mod startup;

pub use errors::{ErrorBody, ErrorPolicy};
pub use headers::{CorsPolicy, SecurityHeadersConfig};
pub use http::{create_router, AppState, MiddlewareConfig, IMAGE_CACHE_CONTROL, PROXY_PATH};
pub use ratelimit::{ClientKey, RateLimitConfig, RateLimitError, RateLimiter};
pub use startup::{run_server_with_config, ServerConfig, ServerHandle};
