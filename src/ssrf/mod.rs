//! Outbound request guards
//!
//! Three layers, cheapest first:
//!
//! - **classify**: pure private/reserved address classification
//! - **url**: synchronous URL gate (scheme allowlist, localhost names,
//!   private-looking literals)
//! - **resolve**: A/AAAA resolution with every answer classified; fails
//!   closed on an empty or partly private answer set
//!
//! Connections are only ever made to an address returned by
//! [`resolve_and_validate`], which closes the DNS rebinding window between
//! validation and connect.

pub mod classify;
pub mod resolve;
pub mod url;

pub use classify::{classify_literal, is_private_ip, ClassifyError, PRIVATE_IPV4_RANGES};
pub use resolve::{
    resolve_and_validate, DnsResolver, HostResolver, LookupError, ResolveError,
    ResolvedAddressSet,
};
pub use url::{
    validate_parsed, validate_url, ForbiddenReason, UrlError, ValidatedTarget, MAX_URL_LENGTH,
};
