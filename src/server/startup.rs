//! Testable server startup logic.
//!
//! Provides [`ServerConfig`] and [`ServerHandle`] so integration tests can
//! spin up a real proxy on an ephemeral port, exercise it over HTTP, and shut
//! it down cleanly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ImgshieldConfig;
use crate::logging::targets;
use crate::media::{HttpTransport, ImageFetcher};
use crate::server::errors::ErrorPolicy;
use crate::server::headers::CorsPolicy;
use crate::server::http::{create_router, MiddlewareConfig};
use crate::ssrf::DnsResolver;

/// Everything needed to start the proxy.
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    pub fetcher: ImageFetcher,
    pub error_policy: ErrorPolicy,
    pub middleware_config: MiddlewareConfig,
}

impl ServerConfig {
    /// Minimal config suitable for integration tests.
    ///
    /// Binds to `127.0.0.1:0` (OS-assigned port), disables all middleware,
    /// and returns error details.
    pub fn for_testing(fetcher: ImageFetcher) -> Self {
        ServerConfig {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            fetcher,
            error_policy: ErrorPolicy::verbose(),
            middleware_config: MiddlewareConfig::none(),
        }
    }

    /// Production wiring: system DNS, reqwest transport, configured policy.
    pub fn from_config(config: &ImgshieldConfig) -> Self {
        let transport = HttpTransport::new(config.policy.host_binding)
            .with_user_agent(config.user_agent.clone());
        let fetcher = ImageFetcher::new(
            Arc::new(DnsResolver::from_system()),
            Arc::new(transport),
            config.fetch.clone(),
        );

        let middleware_config = MiddlewareConfig {
            rate_limit: config.rate_limit.clone(),
            cors: CorsPolicy::new(&config.policy.allowed_origins),
            ..Default::default()
        };

        ServerConfig {
            bind_address: SocketAddr::new(config.bind, config.port),
            fetcher,
            error_policy: ErrorPolicy {
                verbose: config.policy.verbose_errors,
            },
            middleware_config,
        }
    }
}

/// Handle to a running server.  Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    /// The port the server actually bound to (useful when binding to port 0).
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The full local address (ip + port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => info!(target: targets::HTTP, "server stopped"),
            Ok(Ok(Err(e))) => error!("Server task returned error: {}", e),
            Ok(Err(e)) => error!("Server task panicked: {}", e),
            Err(_) => warn!("Server task did not finish within 5s timeout"),
        }
    }
}

/// Bind and serve in a background task.
pub async fn run_server_with_config(config: ServerConfig) -> Result<ServerHandle, std::io::Error> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let app = create_router(
        config.fetcher,
        config.error_policy,
        config.middleware_config,
    );

    // Port 0 binds an ephemeral port
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;
    info!(target: targets::HTTP, addr = %local_addr, "listening");

    let mut shutdown_watch = shutdown_rx;
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown_watch.borrow() {
                    break;
                }
                if shutdown_watch.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        server_task,
    })
}
