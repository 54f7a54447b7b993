//! DNS resolution guard
//!
//! Resolves a hostname (A and AAAA, concurrently), classifies every returned
//! address and fails closed: an empty answer or any private address rejects
//! the whole host. The caller connects only to an address from the returned
//! [`ResolvedAddressSet`], never to a fresh lookup.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tracing::{debug, warn};

use crate::logging::targets;
use crate::ssrf::classify;
use crate::ssrf::url::ValidatedTarget;

/// Errors from a single record lookup
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("lookup failed: {0}")]
pub struct LookupError(pub String);

/// Resolver guard errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("DNS resolution failed for {host}: {message}")]
    DnsFailure { host: String, message: String },

    #[error("{host} resolved to forbidden address {ip}")]
    ForbiddenAddress { host: String, ip: IpAddr },
}

/// Forward lookups used by the guard.
///
/// An empty `Ok` means the record type does not exist for the name.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>, LookupError>;
    async fn lookup_ipv6(&self, host: &str) -> Result<Vec<Ipv6Addr>, LookupError>;
}

/// [`HostResolver`] backed by hickory's tokio resolver.
pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    /// Use the system resolver configuration, falling back to hickory's
    /// default upstreams when it cannot be read.
    pub fn from_system() -> Self {
        let inner = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!(target: targets::DNS, "system resolver config unavailable ({e}), using defaults");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };
        Self { inner }
    }
}

fn is_no_records(e: &hickory_resolver::error::ResolveError) -> bool {
    matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

#[async_trait]
impl HostResolver for DnsResolver {
    async fn lookup_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>, LookupError> {
        match self.inner.ipv4_lookup(host).await {
            Ok(lookup) => Ok(lookup.iter().map(|a| a.0).collect()),
            Err(e) if is_no_records(&e) => Ok(Vec::new()),
            Err(e) => Err(LookupError(e.to_string())),
        }
    }

    async fn lookup_ipv6(&self, host: &str) -> Result<Vec<Ipv6Addr>, LookupError> {
        match self.inner.ipv6_lookup(host).await {
            Ok(lookup) => Ok(lookup.iter().map(|aaaa| aaaa.0).collect()),
            Err(e) if is_no_records(&e) => Ok(Vec::new()),
            Err(e) => Err(LookupError(e.to_string())),
        }
    }
}

/// Non-empty set of public addresses for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddressSet {
    host: String,
    addrs: Vec<IpAddr>,
}

impl ResolvedAddressSet {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn addrs(&self) -> &[IpAddr] {
        &self.addrs
    }

    /// Address to connect to: the first IPv4 result when present.
    pub fn preferred(&self) -> IpAddr {
        self.addrs
            .iter()
            .copied()
            .find(IpAddr::is_ipv4)
            .unwrap_or(self.addrs[0])
    }

    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.preferred(), port)
    }
}

/// Resolve and validate the host of `target`.
///
/// IP-literal hosts skip DNS; the literal is classified directly.
pub async fn resolve_and_validate(
    resolver: &dyn HostResolver,
    target: &ValidatedTarget,
) -> Result<ResolvedAddressSet, ResolveError> {
    let host = target.host();

    if let Some(ip) = target.ip_literal() {
        return validate_set(host, vec![ip]);
    }

    let (v4, v6) = tokio::join!(resolver.lookup_ipv4(host), resolver.lookup_ipv6(host));

    let mut addrs: Vec<IpAddr> = Vec::new();
    let mut failures: Vec<String> = Vec::new();

    match v4 {
        Ok(found) => addrs.extend(found.into_iter().map(IpAddr::V4)),
        Err(e) => failures.push(format!("A: {}", e.0)),
    }
    match v6 {
        Ok(found) => addrs.extend(found.into_iter().map(IpAddr::V6)),
        Err(e) => failures.push(format!("AAAA: {}", e.0)),
    }

    if !failures.is_empty() {
        debug!(target: targets::DNS, host = %host, failures = ?failures, "partial lookup failure");
    }

    if addrs.is_empty() {
        let message = if failures.is_empty() {
            "no addresses returned".to_string()
        } else {
            failures.join("; ")
        };
        return Err(ResolveError::DnsFailure {
            host: host.to_string(),
            message,
        });
    }

    let mut seen = std::collections::HashSet::new();
    addrs.retain(|ip| seen.insert(*ip));

    validate_set(host, addrs)
}

fn validate_set(host: &str, addrs: Vec<IpAddr>) -> Result<ResolvedAddressSet, ResolveError> {
    if let Some(ip) = addrs.iter().copied().find(|ip| classify::is_private_ip(*ip)) {
        warn!(
            target: targets::DNS,
            host = %host,
            resolved_ip = %ip,
            answer_count = addrs.len(),
            "host resolved to a private address"
        );
        return Err(ResolveError::ForbiddenAddress {
            host: host.to_string(),
            ip,
        });
    }

    debug!(target: targets::DNS, host = %host, addrs = ?addrs, "DNS resolved and validated");
    Ok(ResolvedAddressSet {
        host: host.to_string(),
        addrs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssrf::url::validate_url;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StaticResolver {
        v4: HashMap<String, Vec<Ipv4Addr>>,
        v6: HashMap<String, Vec<Ipv6Addr>>,
        fail_v6: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HostResolver for StaticResolver {
        async fn lookup_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.v4.get(host).cloned().unwrap_or_default())
        }

        async fn lookup_ipv6(&self, host: &str) -> Result<Vec<Ipv6Addr>, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_v6 {
                return Err(LookupError("SERVFAIL".to_string()));
            }
            Ok(self.v6.get(host).cloned().unwrap_or_default())
        }
    }

    fn resolver_with(host: &str, v4: &[&str], v6: &[&str]) -> StaticResolver {
        let mut resolver = StaticResolver::default();
        resolver.v4.insert(
            host.to_string(),
            v4.iter().map(|s| s.parse().unwrap()).collect(),
        );
        resolver.v6.insert(
            host.to_string(),
            v6.iter().map(|s| s.parse().unwrap()).collect(),
        );
        resolver
    }

    #[tokio::test]
    async fn test_public_host_resolves() {
        let resolver = resolver_with("example.com", &["93.184.216.34"], &["2606:2800:220:1::1"]);
        let target = validate_url("https://example.com/a.png").unwrap();

        let set = resolve_and_validate(&resolver, &target).await.unwrap();
        assert_eq!(set.addrs().len(), 2);
        assert_eq!(set.preferred(), "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(
            set.socket_addr(443),
            "93.184.216.34:443".parse::<SocketAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_ipv6_only_host() {
        let resolver = resolver_with("v6.example.com", &[], &["2606:2800:220:1::1"]);
        let target = validate_url("https://v6.example.com/a.png").unwrap();

        let set = resolve_and_validate(&resolver, &target).await.unwrap();
        assert_eq!(set.preferred(), "2606:2800:220:1::1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_mixed_public_private_fails_closed() {
        let resolver = resolver_with("rebind.example.com", &["93.184.216.34", "10.0.0.5"], &[]);
        let target = validate_url("https://rebind.example.com/a.png").unwrap();

        let err = resolve_and_validate(&resolver, &target).await.unwrap_err();
        assert_eq!(
            err,
            ResolveError::ForbiddenAddress {
                host: "rebind.example.com".to_string(),
                ip: "10.0.0.5".parse().unwrap(),
            }
        );
    }

    #[tokio::test]
    async fn test_private_ipv6_answer_fails_closed() {
        let resolver = resolver_with("v6.example.com", &["93.184.216.34"], &["fd00::1"]);
        let target = validate_url("https://v6.example.com/a.png").unwrap();

        let err = resolve_and_validate(&resolver, &target).await.unwrap_err();
        assert!(matches!(err, ResolveError::ForbiddenAddress { .. }));
    }

    #[tokio::test]
    async fn test_empty_answer_is_dns_failure() {
        let resolver = StaticResolver::default();
        let target = validate_url("https://nxdomain.example.com/a.png").unwrap();

        let err = resolve_and_validate(&resolver, &target).await.unwrap_err();
        assert!(matches!(err, ResolveError::DnsFailure { .. }));
    }

    #[tokio::test]
    async fn test_one_family_failing_is_tolerated() {
        let mut resolver = resolver_with("example.com", &["93.184.216.34"], &[]);
        resolver.fail_v6 = true;
        let target = validate_url("https://example.com/a.png").unwrap();

        assert!(resolve_and_validate(&resolver, &target).await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_with_no_answers_reports_message() {
        let resolver = StaticResolver {
            fail_v6: true,
            ..Default::default()
        };
        let target = validate_url("https://example.com/a.png").unwrap();

        match resolve_and_validate(&resolver, &target).await {
            Err(ResolveError::DnsFailure { message, .. }) => assert!(message.contains("SERVFAIL")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ip_literal_skips_dns() {
        let resolver = StaticResolver::default();
        let target = validate_url("https://93.184.216.34/a.png").unwrap();

        let set = resolve_and_validate(&resolver, &target).await.unwrap();
        assert_eq!(set.addrs(), &["93.184.216.34".parse::<IpAddr>().unwrap()]);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_answers_collapsed() {
        let resolver = resolver_with("example.com", &["93.184.216.34", "93.184.216.34"], &[]);
        let target = validate_url("https://example.com/a.png").unwrap();

        let set = resolve_and_validate(&resolver, &target).await.unwrap();
        assert_eq!(set.addrs().len(), 1);
    }
}
