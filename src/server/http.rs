//! HTTP surface
//!
//! - `GET /api/proxy-image?url=...` relays a validated image
//! - `OPTIONS` answers CORS preflight with 204
//! - `GET /health` liveness check
//!
//! Every other method on the proxy route, `HEAD` included, gets a JSON 405;
//! unknown paths a JSON 404.

use axum::{
    body::Body,
    extract::{rejection::QueryRejection, ConnectInfo, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::logging::targets;
use crate::media::{ErrorCategory, FetchError, FetchedImage, ImageFetcher};
use crate::server::errors::ErrorPolicy;
use crate::server::headers::{
    preflight_status_middleware, security_headers_middleware, CorsPolicy, SecurityHeadersConfig,
    ALLOWED_METHODS,
};
use crate::server::ratelimit::{
    extract_client_key, rate_limit_middleware, ClientKey, RateLimitConfig, RateLimiter,
};

/// Proxy route path
pub const PROXY_PATH: &str = "/api/proxy-image";

/// Cache policy for relayed images
pub const IMAGE_CACHE_CONTROL: &str = "public, max-age=3600";

/// Middleware configuration for the router
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    /// Security headers configuration
    pub security_headers: SecurityHeadersConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Origins allowed to read proxy responses
    pub cors: CorsPolicy,
    /// Whether to enable security headers middleware
    pub enable_security_headers: bool,
    /// Whether to enable rate limiting middleware
    pub enable_rate_limit: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        MiddlewareConfig {
            security_headers: SecurityHeadersConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cors: CorsPolicy::default(),
            enable_security_headers: true,
            enable_rate_limit: true,
        }
    }
}

impl MiddlewareConfig {
    /// Security headers and rate limiting off (for testing)
    pub fn none() -> Self {
        MiddlewareConfig {
            enable_security_headers: false,
            enable_rate_limit: false,
            ..Default::default()
        }
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    fetcher: ImageFetcher,
    errors: ErrorPolicy,
    trust_proxy_headers: bool,
    start_time: i64,
}

/// Build the router.
pub fn create_router(
    fetcher: ImageFetcher,
    errors: ErrorPolicy,
    middleware_config: MiddlewareConfig,
) -> Router {
    let state = AppState {
        fetcher,
        errors,
        trust_proxy_headers: middleware_config.rate_limit.trust_proxy_headers,
        start_time: chrono::Utc::now().timestamp(),
    };

    // `get` would also serve HEAD
    let mut proxy_route = get(proxy_image_handler)
        .head(method_not_allowed_handler)
        .fallback(method_not_allowed_handler);

    if middleware_config.enable_rate_limit {
        let limiter = RateLimiter::new(middleware_config.rate_limit.clone());
        proxy_route = proxy_route.route_layer(middleware::from_fn_with_state(
            (limiter, errors),
            rate_limit_middleware,
        ));
    }

    let mut router = Router::new()
        .route(PROXY_PATH, proxy_route)
        .route("/health", get(health_handler))
        .fallback(not_found_handler)
        .with_state(state);

    router = router
        .layer(middleware_config.cors.layer())
        .layer(middleware::from_fn(preflight_status_middleware));

    if middleware_config.enable_security_headers {
        router = router.layer(middleware::from_fn_with_state(
            Arc::new(middleware_config.security_headers),
            security_headers_middleware,
        ));
    }

    router
}

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    url: Option<String>,
}

/// GET /api/proxy-image
async fn proxy_image_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    query: Result<Query<ProxyQuery>, QueryRejection>,
) -> Response {
    let client = extract_client_key(
        connect_info.map(|ci| ci.0),
        &headers,
        state.trust_proxy_headers,
    );

    let raw_url = match query {
        Ok(Query(ProxyQuery { url: Some(url) })) if !url.trim().is_empty() => url,
        Ok(_) => {
            log_rejection("", ErrorCategory::InvalidUrl, client, StatusCode::BAD_REQUEST, None);
            return state.errors.request_error(
                StatusCode::BAD_REQUEST,
                "Missing url parameter",
                None,
            );
        }
        Err(rejection) => {
            let detail = rejection.body_text();
            log_rejection(
                "",
                ErrorCategory::InvalidUrl,
                client,
                StatusCode::BAD_REQUEST,
                Some(&detail),
            );
            return state.errors.request_error(
                StatusCode::BAD_REQUEST,
                "Invalid query string",
                Some(detail),
            );
        }
    };

    match state.fetcher.fetch(&raw_url).await {
        Ok(image) => {
            info!(
                target: targets::HTTP,
                url = %raw_url,
                client_ip = %client,
                final_url = %image.final_url,
                redirects = image.redirects,
                status = 200,
                "relaying image"
            );
            image_response(image)
        }
        Err(err) => {
            let detail = err.to_string();
            log_rejection(
                &raw_url,
                err.category(),
                client,
                err.status_code(),
                Some(&detail),
            );
            state.errors.response_for(&err)
        }
    }
}

fn image_response(image: FetchedImage) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, image.content_type.as_str())
        .header(header::CACHE_CONTROL, IMAGE_CACHE_CONTROL)
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff");
    if let Some(len) = image.content_length {
        builder = builder.header(header::CONTENT_LENGTH, len);
    }

    match builder.body(Body::from_stream(image.body)) {
        Ok(response) => response,
        Err(e) => {
            error!(target: targets::HTTP, error = %e, "failed to build image response");
            let err = FetchError::Upstream("invalid upstream headers".to_string());
            ErrorPolicy::production().response_for(&err)
        }
    }
}

fn log_rejection(
    url: &str,
    reason: ErrorCategory,
    client: ClientKey,
    status: StatusCode,
    detail: Option<&str>,
) {
    warn!(
        target: targets::HTTP,
        url,
        reason = reason.as_str(),
        client_ip = %client,
        status = status.as_u16(),
        detail = detail.unwrap_or(""),
        "proxy request rejected"
    );
}

async fn method_not_allowed_handler(State(state): State<AppState>, method: Method) -> Response {
    let mut response = state.errors.request_error(
        StatusCode::METHOD_NOT_ALLOWED,
        "Method not allowed",
        Some(format!("{method} is not supported on {PROXY_PATH}")),
    );
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
    response
}

async fn not_found_handler() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

/// GET /health - liveness check.
async fn health_handler(State(state): State<AppState>) -> Response {
    let uptime = chrono::Utc::now().timestamp() - state.start_time;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeSeconds": uptime,
        })),
    )
        .into_response()
}
