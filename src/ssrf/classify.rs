//! Address classification
//!
//! Decides whether an IP address is reserved for private, loopback,
//! link-local, multicast or carrier-grade NAT use. Pure functions, no I/O.
//!
//! Blocked IPv4 ranges (inclusive bounds, compared as `u32`):
//! - 0.0.0.0/8, 10.0.0.0/8, 100.64.0.0/10, 127.0.0.0/8, 169.254.0.0/16,
//!   172.16.0.0/12, 192.0.0.0/24, 192.168.0.0/16, 198.18.0.0/15,
//!   224.0.0.0/4, 255.255.255.255
//!
//! Blocked IPv6 ranges:
//! - ::1, ::, fc00::/7, fe80::/10, ff00::/8
//! - ::ffff:a.b.c.d, ::a.b.c.d, 64:ff9b::/96 and 2002::/16 are classified
//!   by their embedded IPv4 address

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// A reserved IPv4 range, stored as inclusive `u32` bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Range {
    pub start: u32,
    pub end: u32,
    pub label: &'static str,
}

impl Ipv4Range {
    const fn cidr(a: u8, b: u8, c: u8, d: u8, prefix: u32, label: &'static str) -> Self {
        let start = u32::from_be_bytes([a, b, c, d]);
        let host_mask = if prefix == 32 {
            0
        } else {
            u32::MAX >> prefix
        };
        Ipv4Range {
            start,
            end: start | host_mask,
            label,
        }
    }

    /// Inclusive containment check.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let value = u32::from(ip);
        self.start <= value && value <= self.end
    }
}

/// Reserved IPv4 ranges treated as non-public.
pub const PRIVATE_IPV4_RANGES: &[Ipv4Range] = &[
    Ipv4Range::cidr(0, 0, 0, 0, 8, "current-network"),
    Ipv4Range::cidr(10, 0, 0, 0, 8, "private"),
    Ipv4Range::cidr(100, 64, 0, 0, 10, "cgnat"),
    Ipv4Range::cidr(127, 0, 0, 0, 8, "loopback"),
    Ipv4Range::cidr(169, 254, 0, 0, 16, "link-local"),
    Ipv4Range::cidr(172, 16, 0, 0, 12, "private"),
    Ipv4Range::cidr(192, 0, 0, 0, 24, "ietf-protocol"),
    Ipv4Range::cidr(192, 168, 0, 0, 16, "private"),
    Ipv4Range::cidr(198, 18, 0, 0, 15, "benchmark"),
    Ipv4Range::cidr(224, 0, 0, 0, 4, "multicast"),
    Ipv4Range::cidr(255, 255, 255, 255, 32, "broadcast"),
];

/// Errors from classifying a textual address.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("empty address literal")]
    Empty,

    #[error("unparseable address literal: {0}")]
    Unparseable(String),
}

/// Check whether an IP address is private/reserved.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

/// Check an IPv4 address against [`PRIVATE_IPV4_RANGES`].
pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    private_ipv4_range(ip).is_some()
}

/// The reserved range containing `ip`, if any.
pub fn private_ipv4_range(ip: Ipv4Addr) -> Option<&'static Ipv4Range> {
    PRIVATE_IPV4_RANGES.iter().find(|range| range.contains(ip))
}

/// Check an IPv6 address.
///
/// Forms that carry an IPv4 address (mapped, compatible, 6to4, NAT64) are
/// classified by the embedded address.
pub fn is_private_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_private_ipv4(mapped);
    }

    if ip == Ipv6Addr::LOCALHOST || ip == Ipv6Addr::UNSPECIFIED {
        return true;
    }

    if let Some(embedded) = embedded_ipv4(ip) {
        return is_private_ipv4(embedded);
    }

    let first = ip.segments()[0];

    // fc00::/7 unique local
    if (first & 0xfe00) == 0xfc00 {
        return true;
    }

    // fe80::/10 link-local
    if (first & 0xffc0) == 0xfe80 {
        return true;
    }

    // ff00::/8 multicast
    (first & 0xff00) == 0xff00
}

fn embedded_ipv4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    let seg = ip.segments();
    let from = |hi: u16, lo: u16| Ipv4Addr::from((u32::from(hi) << 16) | u32::from(lo));

    match seg {
        // ::a.b.c.d (deprecated IPv4-compatible)
        [0, 0, 0, 0, 0, 0, hi, lo] => Some(from(hi, lo)),
        // 64:ff9b::/96 NAT64
        [0x0064, 0xff9b, 0, 0, 0, 0, hi, lo] => Some(from(hi, lo)),
        // 2002::/16 6to4
        [0x2002, hi, lo, ..] => Some(from(hi, lo)),
        _ => None,
    }
}

/// Classify a textual IP literal.
///
/// Accepts canonical dotted-quad IPv4 and IPv6 text, with or without
/// surrounding brackets. Octets with leading zeros, numeric shorthand and
/// anything else the standard parser rejects is an error; callers treat an
/// error as a rejection.
pub fn classify_literal(literal: &str) -> Result<bool, ClassifyError> {
    let trimmed = literal.trim();
    if trimmed.is_empty() {
        return Err(ClassifyError::Empty);
    }

    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);

    unbracketed
        .parse::<IpAddr>()
        .map(is_private_ip)
        .map_err(|_| ClassifyError::Unparseable(literal.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_range_bounds_are_private() {
        for range in PRIVATE_IPV4_RANGES {
            assert!(is_private_ipv4(Ipv4Addr::from(range.start)), "{range:?}");
            assert!(is_private_ipv4(Ipv4Addr::from(range.end)), "{range:?}");
        }
    }

    #[test]
    fn test_ten_slash_eight_boundaries() {
        assert!(is_private_ipv4(v4("10.0.0.0")));
        assert!(is_private_ipv4(v4("10.255.255.255")));
        assert!(!is_private_ipv4(v4("9.255.255.255")));
        assert!(!is_private_ipv4(v4("11.0.0.0")));
    }

    #[test]
    fn test_adjacent_values_are_public() {
        let outside = [
            "1.0.0.0",
            "100.63.255.255",
            "100.128.0.0",
            "126.255.255.255",
            "128.0.0.0",
            "169.253.255.255",
            "169.255.0.0",
            "172.15.255.255",
            "172.32.0.0",
            "192.0.1.0",
            "192.167.255.255",
            "192.169.0.0",
            "198.17.255.255",
            "198.20.0.0",
            "223.255.255.255",
            "240.0.0.0",
            "255.255.255.254",
        ];
        for ip in outside {
            assert!(!is_private_ipv4(v4(ip)), "{ip} should be public");
        }
    }

    #[test]
    fn test_range_labels() {
        assert_eq!(private_ipv4_range(v4("100.100.50.25")).unwrap().label, "cgnat");
        assert_eq!(private_ipv4_range(v4("198.19.0.1")).unwrap().label, "benchmark");
        assert_eq!(private_ipv4_range(v4("239.1.1.1")).unwrap().label, "multicast");
        assert_eq!(
            private_ipv4_range(v4("255.255.255.255")).unwrap().label,
            "broadcast"
        );
        assert!(private_ipv4_range(v4("8.8.8.8")).is_none());
    }

    #[test]
    fn test_ipv6_ranges() {
        let private = ["::1", "::", "fc00::1", "fdff::1", "fe80::1", "febf::1", "ff02::1"];
        for ip in private {
            let parsed: Ipv6Addr = ip.parse().unwrap();
            assert!(is_private_ipv6(parsed), "{ip} should be private");
        }

        let public = ["2001:4860:4860::8888", "2606:4700::1111", "fe00::1", "fec0::1"];
        for ip in public {
            let parsed: Ipv6Addr = ip.parse().unwrap();
            assert!(!is_private_ipv6(parsed), "{ip} should be public");
        }
    }

    #[test]
    fn test_ipv4_mapped_ipv6() {
        assert_eq!(classify_literal("::ffff:10.0.0.1"), Ok(true));
        assert_eq!(classify_literal("::ffff:8.8.8.8"), Ok(false));
        assert_eq!(classify_literal("::ffff:169.254.169.254"), Ok(true));
    }

    #[test]
    fn test_embedded_ipv4_forms() {
        // IPv4-compatible
        assert_eq!(classify_literal("::127.0.0.1"), Ok(true));
        assert_eq!(classify_literal("::8.8.8.8"), Ok(false));
        // NAT64
        assert_eq!(classify_literal("64:ff9b::a9fe:a9fe"), Ok(true));
        assert_eq!(classify_literal("64:ff9b::808:808"), Ok(false));
        // 6to4
        assert_eq!(classify_literal("2002:a9fe:a9fe::1"), Ok(true));
        assert_eq!(classify_literal("2002:c0a8:101::"), Ok(true));
        assert_eq!(classify_literal("2002:808:808::1"), Ok(false));
    }

    #[test]
    fn test_classify_literal_brackets_and_whitespace() {
        assert_eq!(classify_literal("[::1]"), Ok(true));
        assert_eq!(classify_literal(" 93.184.216.34 "), Ok(false));
    }

    #[test]
    fn test_classify_literal_rejects_non_canonical() {
        assert_eq!(classify_literal(""), Err(ClassifyError::Empty));
        assert!(classify_literal("010.0.0.1").is_err());
        assert!(classify_literal("0177.0.0.1").is_err());
        assert!(classify_literal("0x7f.0.0.1").is_err());
        assert!(classify_literal("2130706433").is_err());
        assert!(classify_literal("example.com").is_err());
        assert!(classify_literal("256.1.1.1").is_err());
    }
}
