//! Image fetch orchestration
//!
//! Walks a redirect chain by hand, one hop at a time:
//!
//! ```text
//! VALIDATING -> RESOLVING -> FETCHING -> (REDIRECTING -> VALIDATING ...)
//!            -> CONTENT_CHECK -> STREAMING -> DONE
//! ```
//!
//! Every hop target passes the URL gate and the resolver guard before any
//! connection is made to it, and the connection goes to the validated
//! address. A single deadline bounds the whole chain including the body.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::LOCATION;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::logging::targets;
use crate::media::content::{self, ContentError, ImageFormat, SNIFF_LEN};
use crate::media::relay::{read_prefix, relay_body, ImageStream};
use crate::media::transport::{Transport, TransportError, UpstreamResponse};
use crate::ssrf::{
    resolve_and_validate, validate_parsed, validate_url, ForbiddenReason, HostResolver,
    ResolveError, ResolvedAddressSet, UrlError, ValidatedTarget,
};

/// Redirect hops followed before giving up
pub const MAX_REDIRECTS: usize = 3;

/// Default deadline for a whole fetch (30s)
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Upper bound for a configured deadline (5 minutes)
pub const MAX_FETCH_TIMEOUT_MS: u64 = 300_000;

/// Default body ceiling (10 MiB)
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Stable error category, used for logging and response mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    InvalidUrl,
    ForbiddenUrl,
    DnsFailure,
    ForbiddenResolvedIp,
    TooManyRedirects,
    MissingRedirectLocation,
    UpstreamStatus,
    Upstream,
    ContentTypeRejected,
    SignatureRejected,
    TooSmall,
    TooLarge,
    Timeout,
    RateLimited,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::InvalidUrl => "invalid_url",
            ErrorCategory::ForbiddenUrl => "forbidden_url",
            ErrorCategory::DnsFailure => "dns_failure",
            ErrorCategory::ForbiddenResolvedIp => "forbidden_resolved_ip",
            ErrorCategory::TooManyRedirects => "too_many_redirects",
            ErrorCategory::MissingRedirectLocation => "missing_redirect_location",
            ErrorCategory::UpstreamStatus => "upstream_status",
            ErrorCategory::Upstream => "upstream",
            ErrorCategory::ContentTypeRejected => "content_type_rejected",
            ErrorCategory::SignatureRejected => "signature_rejected",
            ErrorCategory::TooSmall => "too_small",
            ErrorCategory::TooLarge => "too_large",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimited => "rate_limited",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCategory::InvalidUrl
            | ErrorCategory::ForbiddenUrl
            | ErrorCategory::DnsFailure
            | ErrorCategory::ForbiddenResolvedIp
            | ErrorCategory::TooManyRedirects
            | ErrorCategory::MissingRedirectLocation => StatusCode::BAD_REQUEST,
            ErrorCategory::UpstreamStatus
            | ErrorCategory::Upstream
            | ErrorCategory::ContentTypeRejected
            | ErrorCategory::SignatureRejected
            | ErrorCategory::TooSmall => StatusCode::BAD_GATEWAY,
            ErrorCategory::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCategory::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCategory::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that end a fetch. None are retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("forbidden URL ({reason}): {detail}")]
    ForbiddenUrl {
        reason: ForbiddenReason,
        detail: String,
    },

    #[error("DNS resolution failed for {host}: {message}")]
    DnsFailure { host: String, message: String },

    #[error("{host} resolved to forbidden address {ip}")]
    ForbiddenResolvedIp { host: String, ip: IpAddr },

    #[error("too many redirects (max {max})")]
    TooManyRedirects { max: usize },

    #[error("redirect status {status} without a Location header")]
    MissingRedirectLocation { status: u16 },

    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16 },

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("content type rejected: {0}")]
    ContentTypeRejected(String),

    #[error("leading bytes match no supported image signature")]
    SignatureRejected,

    #[error("response too small: {size} bytes (need {min})")]
    TooSmall { size: usize, min: usize },

    #[error("response exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("fetch exceeded {timeout_ms}ms deadline")]
    Timeout { timeout_ms: u64 },
}

impl FetchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FetchError::InvalidUrl(_) => ErrorCategory::InvalidUrl,
            FetchError::ForbiddenUrl { .. } => ErrorCategory::ForbiddenUrl,
            FetchError::DnsFailure { .. } => ErrorCategory::DnsFailure,
            FetchError::ForbiddenResolvedIp { .. } => ErrorCategory::ForbiddenResolvedIp,
            FetchError::TooManyRedirects { .. } => ErrorCategory::TooManyRedirects,
            FetchError::MissingRedirectLocation { .. } => ErrorCategory::MissingRedirectLocation,
            FetchError::UpstreamStatus { .. } => ErrorCategory::UpstreamStatus,
            FetchError::Upstream(_) => ErrorCategory::Upstream,
            FetchError::ContentTypeRejected(_) => ErrorCategory::ContentTypeRejected,
            FetchError::SignatureRejected => ErrorCategory::SignatureRejected,
            FetchError::TooSmall { .. } => ErrorCategory::TooSmall,
            FetchError::TooLarge { .. } => ErrorCategory::TooLarge,
            FetchError::Timeout { .. } => ErrorCategory::Timeout,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.category().status_code()
    }
}

impl From<UrlError> for FetchError {
    fn from(e: UrlError) -> Self {
        match e {
            UrlError::Invalid(msg) => FetchError::InvalidUrl(msg),
            UrlError::Forbidden { reason, detail } => FetchError::ForbiddenUrl { reason, detail },
        }
    }
}

impl From<ResolveError> for FetchError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::DnsFailure { host, message } => FetchError::DnsFailure { host, message },
            ResolveError::ForbiddenAddress { host, ip } => {
                FetchError::ForbiddenResolvedIp { host, ip }
            }
        }
    }
}

impl From<ContentError> for FetchError {
    fn from(e: ContentError) -> Self {
        match e {
            ContentError::TooSmall { size, min } => FetchError::TooSmall { size, min },
            ContentError::BadSignature => FetchError::SignatureRejected,
            other => FetchError::ContentTypeRejected(other.to_string()),
        }
    }
}

impl From<TransportError> for FetchError {
    fn from(e: TransportError) -> Self {
        FetchError::Upstream(e.to_string())
    }
}

/// Fetch limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Body ceiling in bytes (default: 10 MiB)
    pub max_bytes: u64,

    /// Deadline for the whole fetch in milliseconds (default: 30s, max: 5min)
    pub timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
        }
    }
}

impl FetchConfig {
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Set the deadline, capped at [`MAX_FETCH_TIMEOUT_MS`]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms.min(MAX_FETCH_TIMEOUT_MS);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Orchestrator states. `FAILED` is the `Err` side of [`ImageFetcher::fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStage {
    Validating,
    Resolving,
    Fetching,
    Redirecting,
    ContentCheck,
    Streaming,
}

/// Per-request state. Only the redirect step advances the target.
#[derive(Debug)]
pub struct FetchState {
    current: ValidatedTarget,
    addr: SocketAddr,
    hops: usize,
    stage: FetchStage,
}

impl FetchState {
    fn new(target: ValidatedTarget, resolved: &ResolvedAddressSet) -> Self {
        let addr = resolved.socket_addr(target.port());
        Self {
            current: target,
            addr,
            hops: 0,
            stage: FetchStage::Resolving,
        }
    }

    pub fn current(&self) -> &ValidatedTarget {
        &self.current
    }

    /// Validated address the current hop connects to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn hops(&self) -> usize {
        self.hops
    }

    pub fn stage(&self) -> FetchStage {
        self.stage
    }

    fn enter(&mut self, stage: FetchStage) {
        debug!(
            target: targets::PROXY,
            stage = ?stage,
            hop = self.hops,
            host = %self.current.host(),
            "fetch stage"
        );
        self.stage = stage;
    }

    /// Advance to an already validated and resolved redirect target.
    fn redirect(
        &mut self,
        next: ValidatedTarget,
        resolved: &ResolvedAddressSet,
    ) -> Result<(), FetchError> {
        self.hops += 1;
        if self.hops > MAX_REDIRECTS {
            return Err(FetchError::TooManyRedirects { max: MAX_REDIRECTS });
        }
        self.addr = resolved.socket_addr(next.port());
        self.current = next;
        Ok(())
    }
}

/// A validated image ready to relay.
pub struct FetchedImage {
    /// Upstream `Content-Type`, validated
    pub content_type: String,
    pub format: ImageFormat,
    /// Upstream `Content-Length`, when declared
    pub content_length: Option<u64>,
    pub final_url: Url,
    pub redirects: usize,
    pub body: ImageStream,
}

impl fmt::Debug for FetchedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedImage")
            .field("content_type", &self.content_type)
            .field("format", &self.format)
            .field("content_length", &self.content_length)
            .field("final_url", &self.final_url.as_str())
            .field("redirects", &self.redirects)
            .finish_non_exhaustive()
    }
}

/// Image fetcher with SSRF protection
///
/// 1. URL validation (scheme, localhost names, private literals)
/// 2. DNS resolution with every answer validated
/// 3. Connection pinned to the validated address
/// 4. Redirects followed manually, each hop re-validated
/// 5. Content type and signature checked before relaying
/// 6. Streaming with a size ceiling
#[derive(Clone)]
pub struct ImageFetcher {
    resolver: Arc<dyn HostResolver>,
    transport: Arc<dyn Transport>,
    config: FetchConfig,
}

impl ImageFetcher {
    pub fn new(
        resolver: Arc<dyn HostResolver>,
        transport: Arc<dyn Transport>,
        config: FetchConfig,
    ) -> Self {
        Self {
            resolver,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetch an image from a caller-supplied URL.
    pub async fn fetch(&self, raw_url: &str) -> Result<FetchedImage, FetchError> {
        let target = validate_url(raw_url)?;
        self.fetch_target(target).await
    }

    /// Validate and resolve `raw_url` without connecting to it.
    pub async fn preflight(&self, raw_url: &str) -> Result<ResolvedAddressSet, FetchError> {
        let target = validate_url(raw_url)?;
        Ok(resolve_and_validate(self.resolver.as_ref(), &target).await?)
    }

    /// Fetch an already validated target under the configured deadline.
    pub async fn fetch_target(&self, target: ValidatedTarget) -> Result<FetchedImage, FetchError> {
        let deadline = Instant::now() + self.config.timeout();

        match tokio::time::timeout_at(deadline, self.run(target, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                timeout_ms: self.config.timeout_ms,
            }),
        }
    }

    async fn run(
        &self,
        target: ValidatedTarget,
        deadline: Instant,
    ) -> Result<FetchedImage, FetchError> {
        let resolved = resolve_and_validate(self.resolver.as_ref(), &target).await?;
        let mut state = FetchState::new(target, &resolved);

        loop {
            state.enter(FetchStage::Fetching);
            let response = self.transport.send(&state.current, state.addr).await?;

            if response.status.is_redirection() {
                state.enter(FetchStage::Redirecting);
                let location = redirect_location(&state, &response)?;
                drop(response);

                state.enter(FetchStage::Validating);
                let next = validate_parsed(location)?;

                state.enter(FetchStage::Resolving);
                let resolved = resolve_and_validate(self.resolver.as_ref(), &next).await?;
                state.redirect(next, &resolved)?;

                debug!(
                    target: targets::PROXY,
                    hop = state.hops,
                    url = %state.current.url(),
                    addr = %state.addr,
                    "following redirect"
                );
                continue;
            }

            if !response.status.is_success() {
                return Err(FetchError::UpstreamStatus {
                    status: response.status.as_u16(),
                });
            }

            state.enter(FetchStage::ContentCheck);
            return self.accept(state, response, deadline).await;
        }
    }

    async fn accept(
        &self,
        mut state: FetchState,
        response: UpstreamResponse,
        deadline: Instant,
    ) -> Result<FetchedImage, FetchError> {
        let limit = self.config.max_bytes;
        let content_type = content::check_content_type(&response.headers)?;

        let content_length = response.content_length();
        if let Some(declared) = content_length {
            if declared > limit {
                return Err(FetchError::TooLarge { limit });
            }
        }

        let mut body = response.body;
        let prefix = read_prefix(&mut body, SNIFF_LEN, limit).await?;
        let format = content::sniff_signature(&prefix)?;

        state.enter(FetchStage::Streaming);
        info!(
            target: targets::PROXY,
            url = %state.current.url(),
            redirects = state.hops,
            format = %format,
            content_length = ?content_length,
            "upstream image accepted"
        );

        Ok(FetchedImage {
            content_type,
            format,
            content_length,
            final_url: state.current.url().clone(),
            redirects: state.hops,
            body: relay_body(prefix, body, limit, deadline, self.config.timeout_ms),
        })
    }
}

fn redirect_location(state: &FetchState, response: &UpstreamResponse) -> Result<Url, FetchError> {
    let status = response.status.as_u16();
    let location = response
        .headers
        .get(LOCATION)
        .ok_or(FetchError::MissingRedirectLocation { status })?
        .to_str()
        .map_err(|_| FetchError::InvalidUrl("redirect location is not valid text".to_string()))?;

    Ok(state.current.join(location)?)
}
