//! Response header middleware
//!
//! - Security headers on every response (API profile: nothing may load or
//!   frame the proxy's output)
//! - CORS via [`CorsLayer`]: `Access-Control-Allow-Origin` echoed only for
//!   allowlisted origins, always with `Vary: Origin`

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Method, Request, Response, StatusCode},
    middleware::Next,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Methods the proxy route accepts
pub const ALLOWED_METHODS: &str = "GET, OPTIONS";

/// Preflight cache lifetime
const CORS_MAX_AGE: Duration = Duration::from_secs(600);

/// Security headers configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityHeadersConfig {
    /// Content-Security-Policy header value
    pub csp: String,
    /// X-Frame-Options header value
    pub frame_options: String,
    /// X-Content-Type-Options header value
    pub content_type_options: String,
    /// Referrer-Policy header value
    pub referrer_policy: String,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        SecurityHeadersConfig {
            csp: "default-src 'none'; frame-ancestors 'none'".to_string(),
            frame_options: "DENY".to_string(),
            content_type_options: "nosniff".to_string(),
            referrer_policy: "no-referrer".to_string(),
        }
    }
}

/// Security headers middleware
///
/// Use with `axum::middleware::from_fn_with_state`.
pub async fn security_headers_middleware(
    State(config): State<Arc<SecurityHeadersConfig>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    let pairs = [
        (header::CONTENT_SECURITY_POLICY, &config.csp),
        (header::X_CONTENT_TYPE_OPTIONS, &config.content_type_options),
        (header::X_FRAME_OPTIONS, &config.frame_options),
        (header::REFERRER_POLICY, &config.referrer_policy),
    ];
    for (name, value) in pairs {
        if value.is_empty() {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }

    response
}

/// Origin allowlist
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
}

impl CorsPolicy {
    /// Origins are compared exactly, after trimming a trailing `/`.
    /// A wildcard entry is ignored.
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_origins = origins
            .into_iter()
            .map(|o| o.as_ref().trim().trim_end_matches('/').to_string())
            .filter(|o| !o.is_empty() && o != "*")
            .collect();
        Self { allowed_origins }
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.allowed_origins
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|allowed| allowed == origin)
    }

    /// CORS layer for the router.
    pub fn layer(&self) -> CorsLayer {
        let origins: Vec<HeaderValue> = self
            .allowed_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::OPTIONS])
            .max_age(CORS_MAX_AGE)
            .vary([header::ORIGIN])
    }
}

/// [`CorsLayer`] answers every `OPTIONS` itself with 200; preflights get 204.
///
/// Use with `axum::middleware::from_fn`, outside the CORS layer.
pub async fn preflight_status_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let is_options = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if is_options && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}
