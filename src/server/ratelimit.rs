//! Rate limiting middleware
//!
//! Per-client fixed-window counter: the first request from a client opens a
//! window with a fixed request budget, requests past the budget are refused
//! until the window ends, and the next request after that opens a fresh
//! window. State is in-process only; multiple instances each keep their own
//! counts.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Method, Request, Uri},
    middleware::Next,
    response::Response,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::logging::targets;
use crate::server::errors::ErrorPolicy;

/// Default request budget per window
pub const DEFAULT_MAX_REQUESTS: u32 = 10;

/// Default window length
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Rate limit errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    LimitExceeded { retry_after_secs: u64 },
}

/// Rate limiting configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub max_requests: u32,
    /// Window length
    pub window: Duration,
    /// Whether rate limiting is enabled
    pub enabled: bool,
    /// Use `X-Forwarded-For` / `X-Real-IP` for the client key
    pub trust_proxy_headers: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
            enabled: true,
            trust_proxy_headers: false,
        }
    }
}

impl RateLimitConfig {
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }
}

/// Builder for RateLimitConfig
#[derive(Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn max_requests(mut self, max_requests: u32) -> Self {
        self.config.max_requests = max_requests;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.config.trust_proxy_headers = trust;
        self
    }

    pub fn build(self) -> RateLimitConfig {
        self.config
    }
}

/// Key a window is tracked under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKey {
    Ip(IpAddr),
    /// No address could be determined; all such requests share one window
    Unknown,
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKey::Ip(ip) => write!(f, "{ip}"),
            ClientKey::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowRecord {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window limiter. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RateLimiter {
    records: Arc<Mutex<HashMap<ClientKey, WindowRecord>>>,
    config: Arc<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            records: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    /// Count a request from `key`.
    pub fn check(&self, key: ClientKey) -> Result<(), RateLimitError> {
        self.check_at(key, Instant::now())
    }

    /// Count a request from `key` at `now`.
    pub fn check_at(&self, key: ClientKey, now: Instant) -> Result<(), RateLimitError> {
        if !self.config.enabled {
            return Ok(());
        }

        let window = self.config.window;
        let mut records = self.records.lock();
        let record = records.entry(key).or_insert(WindowRecord {
            count: 0,
            reset_at: now + window,
        });

        if now >= record.reset_at {
            record.count = 0;
            record.reset_at = now + window;
        }

        if record.count >= self.config.max_requests {
            let remaining = record.reset_at.saturating_duration_since(now);
            return Err(RateLimitError::LimitExceeded {
                retry_after_secs: ceil_secs(remaining),
            });
        }

        record.count += 1;
        Ok(())
    }

    /// Number of clients with a record (stale records included).
    pub fn tracked_clients(&self) -> usize {
        self.records.lock().len()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

/// Whole seconds, rounded up, at least 1.
fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

/// Extract the client key from the request
pub fn extract_client_key(
    remote_addr: Option<SocketAddr>,
    headers: &axum::http::HeaderMap,
    trust_proxy: bool,
) -> ClientKey {
    if trust_proxy {
        // Leftmost X-Forwarded-For entry is the original client
        if let Some(ip) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
        {
            return ClientKey::Ip(ip);
        }

        if let Some(ip) = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
        {
            return ClientKey::Ip(ip);
        }
    }

    remote_addr
        .map(|addr| ClientKey::Ip(addr.ip()))
        .unwrap_or(ClientKey::Unknown)
}

/// The `url` query parameter as sent, or the raw query when there is none.
fn requested_url(uri: &Uri) -> String {
    let query = uri.query().unwrap_or_default();
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == "url")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| query.to_string())
}

/// Rate limiting middleware. CORS preflights are not counted.
///
/// Use with `axum::middleware::from_fn_with_state`.
pub async fn rate_limit_middleware(
    State((limiter, policy)): State<(RateLimiter, ErrorPolicy)>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let config = limiter.config();
    if !config.enabled || request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let remote_addr = connect_info.map(|ci| ci.0);
    let key = extract_client_key(remote_addr, request.headers(), config.trust_proxy_headers);

    match limiter.check(key) {
        Ok(()) => {
            debug!(target: targets::HTTP, client_ip = %key, "rate limit check passed");
            next.run(request).await
        }
        Err(RateLimitError::LimitExceeded { retry_after_secs }) => {
            warn!(
                target: targets::HTTP,
                client_ip = %key,
                reason = "rate_limited",
                status = 429,
                retry_after_secs,
                url = %requested_url(request.uri()),
                path = %request.uri().path(),
                "request rejected"
            );
            policy.rate_limited(retry_after_secs)
        }
    }
}
