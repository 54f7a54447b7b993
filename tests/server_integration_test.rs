//! Integration tests over real sockets.
//!
//! Each test spins up the proxy on an ephemeral port via
//! [`run_server_with_config`] and, where needed, a local upstream image
//! server, then shuts everything down cleanly.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use parking_lot::Mutex;

use imgshield::media::{
    FetchConfig, HostBinding, HttpTransport, ImageFetcher, Transport, TransportError,
    UpstreamResponse,
};
use imgshield::server::startup::{run_server_with_config, ServerConfig, ServerHandle};
use imgshield::ssrf::{validate_url, HostResolver, LookupError, ValidatedTarget};

const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

fn png(len: usize) -> Vec<u8> {
    let mut body = PNG_MAGIC.to_vec();
    body.resize(len, 0x7E);
    body
}

// ---------------------------------------------------------------------------
// Local upstream
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct UpstreamHits(Arc<AtomicUsize>);

impl UpstreamHits {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

async fn upstream_png(State(hits): State<UpstreamHits>) -> impl IntoResponse {
    hits.0.fetch_add(1, Ordering::SeqCst);
    ([(header::CONTENT_TYPE, "image/png")], png(1500))
}

async fn upstream_redirect(State(hits): State<UpstreamHits>) -> impl IntoResponse {
    hits.0.fetch_add(1, Ordering::SeqCst);
    (StatusCode::FOUND, [(header::LOCATION, "/a.png")])
}

async fn upstream_echo_host(State(hits): State<UpstreamHits>, headers: HeaderMap) -> String {
    hits.0.fetch_add(1, Ordering::SeqCst);
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn spawn_upstream() -> (SocketAddr, UpstreamHits) {
    let hits = UpstreamHits::default();
    let app = Router::new()
        .route("/a.png", get(upstream_png))
        .route("/redirect", get(upstream_redirect))
        .route("/echo-host", get(upstream_echo_host))
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, hits)
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Answers every name with one address.
struct OneAddress(Ipv4Addr);

#[async_trait]
impl HostResolver for OneAddress {
    async fn lookup_ipv4(&self, _host: &str) -> Result<Vec<Ipv4Addr>, LookupError> {
        Ok(vec![self.0])
    }

    async fn lookup_ipv6(&self, _host: &str) -> Result<Vec<Ipv6Addr>, LookupError> {
        Ok(Vec::new())
    }
}

/// Real HTTP transport whose connections are redirected to the local upstream.
/// Records the validated address it was asked to use.
struct LoopbackTransport {
    inner: HttpTransport,
    upstream: SocketAddr,
    asked: Mutex<Vec<SocketAddr>>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(
        &self,
        target: &ValidatedTarget,
        addr: SocketAddr,
    ) -> Result<UpstreamResponse, TransportError> {
        self.asked.lock().push(addr);
        self.inner.send(target, self.upstream).await
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

async fn start_proxy(fetcher: ImageFetcher) -> ServerHandle {
    run_server_with_config(ServerConfig::for_testing(fetcher))
        .await
        .unwrap()
}

fn proxy_url(handle: &ServerHandle, target: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
    format!("{}/api/proxy-image?url={}", handle.base_url(), encoded)
}

fn idle_fetcher() -> ImageFetcher {
    ImageFetcher::new(
        Arc::new(OneAddress(Ipv4Addr::new(93, 184, 216, 34))),
        Arc::new(HttpTransport::default()),
        FetchConfig::default(),
    )
}

async fn collect(response: UpstreamResponse) -> Vec<u8> {
    let mut out = Vec::new();
    let mut body = response.body;
    while let Some(chunk) = body.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}

// ---------------------------------------------------------------------------
// 1. Lifecycle and plain endpoints
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_starts_and_binds() {
    let handle = start_proxy(idle_fetcher()).await;
    assert_ne!(handle.port(), 0, "OS should assign a non-zero port");
    assert!(handle.local_addr().ip().is_loopback());
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_endpoint_responds() {
    let handle = start_proxy(idle_fetcher()).await;

    let resp = client()
        .get(format!("{}/health", handle.base_url()))
        .send()
        .await
        .expect("GET /health failed");
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body.get("version").is_some());
    assert!(body.get("uptimeSeconds").is_some());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nonexistent_route_returns_404() {
    let handle = start_proxy(idle_fetcher()).await;
    let resp = client()
        .get(format!("{}/does-not-exist", handle.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_post_returns_405() {
    let handle = start_proxy(idle_fetcher()).await;
    let resp = client()
        .post(proxy_url(&handle, "https://example.com/a.png"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);
    assert_eq!(resp.headers().get("allow").unwrap(), "GET, OPTIONS");
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 2. reqwest transport against a real upstream
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pinned_transport_connects_to_given_address() {
    let (upstream, hits) = spawn_upstream().await;
    // The name does not exist; only the pinned address makes this reachable
    let target = validate_url(&format!("http://img.invalid:{}/a.png", upstream.port())).unwrap();

    let response = HttpTransport::default().send(&target, upstream).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers.get(header::CONTENT_TYPE).unwrap(), "image/png");
    assert_eq!(collect(response).await, png(1500));
    assert_eq!(hits.count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transport_does_not_follow_redirects() {
    let (upstream, hits) = spawn_upstream().await;
    let target =
        validate_url(&format!("http://img.invalid:{}/redirect", upstream.port())).unwrap();

    let response = HttpTransport::default().send(&target, upstream).await.unwrap();
    assert_eq!(response.status, StatusCode::FOUND);
    assert_eq!(response.headers.get(header::LOCATION).unwrap(), "/a.png");
    assert_eq!(hits.count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_header_preserved_by_both_bindings() {
    let (upstream, _hits) = spawn_upstream().await;
    let target =
        validate_url(&format!("http://img.invalid:{}/echo-host", upstream.port())).unwrap();
    let expected = format!("img.invalid:{}", upstream.port());

    for binding in [HostBinding::Pinned, HostBinding::IpHostHeader] {
        let response = HttpTransport::new(binding).send(&target, upstream).await.unwrap();
        let host = String::from_utf8(collect(response).await).unwrap();
        assert_eq!(host, expected, "{binding}");
    }
}

// ---------------------------------------------------------------------------
// 3. End to end through the proxy
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_refuses_host_resolving_to_loopback() {
    let (upstream, hits) = spawn_upstream().await;
    let fetcher = ImageFetcher::new(
        Arc::new(OneAddress(Ipv4Addr::LOCALHOST)),
        Arc::new(HttpTransport::default()),
        FetchConfig::default(),
    );
    let handle = start_proxy(fetcher).await;

    let target = format!("http://img.invalid:{}/a.png", upstream.port());
    let resp = client()
        .get(proxy_url(&handle, &target))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(hits.count(), 0);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_relays_image_end_to_end() {
    let (upstream, hits) = spawn_upstream().await;
    let transport = Arc::new(LoopbackTransport {
        inner: HttpTransport::default(),
        upstream,
        asked: Mutex::new(Vec::new()),
    });
    let fetcher = ImageFetcher::new(
        Arc::new(OneAddress(Ipv4Addr::new(93, 184, 216, 34))),
        transport.clone(),
        FetchConfig::default(),
    );
    let handle = start_proxy(fetcher).await;

    // The redirect is walked by the proxy, not by reqwest
    let target = format!("http://img.invalid:{}/redirect", upstream.port());
    let resp = client()
        .get(proxy_url(&handle, &target))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "image/png");
    assert_eq!(resp.headers().get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), png(1500).as_slice());

    assert_eq!(hits.count(), 2);
    let asked = transport.asked.lock();
    assert_eq!(asked.len(), 2);
    for addr in asked.iter() {
        assert_eq!(addr.ip(), Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(addr.port(), upstream.port());
    }

    handle.shutdown().await;
}
