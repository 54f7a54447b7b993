//! Image fetch pipeline
//!
//! - **ImageFetcher**: manual redirect walking with per-hop URL and DNS
//!   validation, all under one deadline
//! - **Transport**: one GET per hop to a validated address, redirects never
//!   followed automatically
//! - **Content gate**: declared `Content-Type` plus magic-byte sniffing
//! - **Relay**: incremental forwarding with a hard byte ceiling
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use imgshield::media::{FetchConfig, HttpTransport, ImageFetcher};
//! use imgshield::ssrf::DnsResolver;
//!
//! let fetcher = ImageFetcher::new(
//!     Arc::new(DnsResolver::from_system()),
//!     Arc::new(HttpTransport::default()),
//!     FetchConfig::default(),
//! );
//! let image = fetcher.fetch("https://example.com/image.png").await?;
//! println!("{} ({:?} bytes)", image.content_type, image.content_length);
//! ```

pub mod content;
pub mod fetch;
pub mod relay;
pub mod transport;

pub use content::{ContentError, ImageFormat, SNIFF_LEN};
pub use fetch::{
    ErrorCategory, FetchConfig, FetchError, FetchStage, FetchState, FetchedImage, ImageFetcher,
    DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_MAX_BYTES, MAX_FETCH_TIMEOUT_MS, MAX_REDIRECTS,
};
pub use relay::ImageStream;
pub use transport::{
    BodyStream, HostBinding, HttpTransport, Transport, TransportError, UpstreamResponse,
    DEFAULT_USER_AGENT,
};
