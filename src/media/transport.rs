//! Upstream HTTP transport
//!
//! Every request goes to a socket address the resolver guard already
//! validated. Automatic redirect following is disabled; redirects come back
//! to the orchestrator as ordinary 3xx responses.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_LENGTH, HOST};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::logging::targets;
use crate::ssrf::ValidatedTarget;

/// Default `User-Agent` sent upstream
pub const DEFAULT_USER_AGENT: &str = concat!("imgshield/", env!("CARGO_PKG_VERSION"));

/// Default TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream body chunks
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to read response body: {0}")]
    Body(String),
}

/// How the validated address is bound to the outgoing connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostBinding {
    /// Keep the hostname in the URL and pin its resolution to the
    /// validated address for this client only. TLS uses the hostname.
    #[default]
    Pinned,
    /// Put the validated IP in the URL and send the original `Host` header.
    /// Applies to plain http; https targets use [`HostBinding::Pinned`].
    IpHostHeader,
}

impl HostBinding {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostBinding::Pinned => "pinned",
            HostBinding::IpHostHeader => "ip-host-header",
        }
    }

    /// Binding actually used for `target`.
    pub fn effective_for(&self, target: &ValidatedTarget) -> HostBinding {
        match self {
            HostBinding::IpHostHeader if !target.is_https() => HostBinding::IpHostHeader,
            _ => HostBinding::Pinned,
        }
    }
}

impl fmt::Display for HostBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostBinding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pinned" => Ok(HostBinding::Pinned),
            "ip-host-header" => Ok(HostBinding::IpHostHeader),
            other => Err(format!(
                "unknown host binding '{other}' (expected 'pinned' or 'ip-host-header')"
            )),
        }
    }
}

/// Response head plus a lazily read body.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl UpstreamResponse {
    /// Declared `Content-Length`, if present and numeric.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Sends one GET for one hop. Implementations must not follow redirects and
/// must connect only to `addr`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        target: &ValidatedTarget,
        addr: SocketAddr,
    ) -> Result<UpstreamResponse, TransportError>;
}

/// reqwest-backed [`Transport`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    binding: HostBinding,
    user_agent: String,
    connect_timeout: Duration,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(HostBinding::default())
    }
}

impl HttpTransport {
    pub fn new(binding: HostBinding) -> Self {
        Self {
            binding,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn binding(&self) -> HostBinding {
        self.binding
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        target: &ValidatedTarget,
        addr: SocketAddr,
    ) -> Result<UpstreamResponse, TransportError> {
        // A client per hop: the resolve override must only ever apply to this hop.
        // Environment proxies are ignored so the validated address is what we dial.
        let mut builder = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .connect_timeout(self.connect_timeout)
            .user_agent(self.user_agent.as_str());

        let mut request_url = target.url().clone();
        let mut host_header = None;

        match self.binding.effective_for(target) {
            HostBinding::Pinned => {
                if target.ip_literal().is_none() {
                    builder = builder.resolve(target.host(), addr);
                }
            }
            HostBinding::IpHostHeader => {
                request_url
                    .set_ip_host(addr.ip())
                    .map_err(|_| TransportError::Client("cannot rewrite URL host".to_string()))?;
                request_url
                    .set_port(Some(addr.port()))
                    .map_err(|_| TransportError::Client("cannot rewrite URL port".to_string()))?;
                host_header = Some(
                    HeaderValue::from_str(&target.host_header())
                        .map_err(|e| TransportError::Client(e.to_string()))?,
                );
            }
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        let mut request = client
            .get(request_url)
            .header(ACCEPT, HeaderValue::from_static("image/*"));
        if let Some(host) = host_header {
            request = request.header(HOST, host);
        }

        debug!(
            target: targets::PROXY,
            url = %target.url(),
            addr = %addr,
            binding = %self.binding.effective_for(target),
            "sending upstream request"
        );

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map_err(|e| TransportError::Body(e.to_string()))
            .boxed();

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssrf::validate_url;

    #[test]
    fn test_host_binding_parse() {
        assert_eq!("pinned".parse::<HostBinding>(), Ok(HostBinding::Pinned));
        assert_eq!(
            " IP-Host-Header ".parse::<HostBinding>(),
            Ok(HostBinding::IpHostHeader)
        );
        assert!("re-resolve".parse::<HostBinding>().is_err());
        assert_eq!(HostBinding::default(), HostBinding::Pinned);
    }

    #[test]
    fn test_https_falls_back_to_pinned() {
        let https = validate_url("https://example.com/a.png").unwrap();
        let http = validate_url("http://example.com/a.png").unwrap();

        assert_eq!(
            HostBinding::IpHostHeader.effective_for(&https),
            HostBinding::Pinned
        );
        assert_eq!(
            HostBinding::IpHostHeader.effective_for(&http),
            HostBinding::IpHostHeader
        );
        assert_eq!(HostBinding::Pinned.effective_for(&http), HostBinding::Pinned);
    }

    #[test]
    fn test_content_length_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("2048"));
        let response = UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: futures_util::stream::empty().boxed(),
        };
        assert_eq!(response.content_length(), Some(2048));

        let response = UpstreamResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: futures_util::stream::empty().boxed(),
        };
        assert_eq!(response.content_length(), None);
    }

    #[test]
    fn test_transport_builder() {
        let transport = HttpTransport::new(HostBinding::IpHostHeader)
            .with_user_agent("test-agent/1.0")
            .with_connect_timeout(Duration::from_secs(2));
        assert_eq!(transport.binding(), HostBinding::IpHostHeader);
        assert_eq!(transport.user_agent, "test-agent/1.0");
        assert_eq!(transport.connect_timeout, Duration::from_secs(2));
    }
}
