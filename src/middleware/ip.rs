//! Client IP resolution for rate-limit keys.
//!
//! # Trust Model
//!
//! Proxy headers (`X-Forwarded-For`, `X-Real-IP`) are client-controlled. They
//! are only honoured when the TCP peer is a trusted proxy:
//!
//! | `TRUSTED_PROXIES` | Peer address known | Result                                   |
//! |-------------------|--------------------|------------------------------------------|
//! | empty             | any                | header IP, else peer, else `unknown`     |
//! | configured        | peer in a range    | header IP, else peer                     |
//! | configured        | peer not in range  | peer (headers ignored, logged at debug)  |
//! | configured        | no peer            | `unknown`                                |
//!
//! Header values that do not parse as an IP address are ignored, falling
//! through to the next source.
//!
//! An empty list trusts every source. That is only safe when the service is
//! unreachable except through a proxy that overwrites these headers:
//!
//! ```nginx
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! ## The "unknown" Fallback
//!
//! Requests with no resolvable address share the `"unknown"` key and are
//! therefore limited collectively. Monitor for high "unknown" traffic.

use std::borrow::Cow;
use std::net::IpAddr;

use axum::http::HeaderMap;
use tracing::{debug, warn};

/// Fallback key when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse CIDR notation (`10.0.0.0/8`, `::1/128`) or a bare address.
    ///
    /// Returns `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok()?,
            None => max_prefix,
        };
        if prefix_len > max_prefix {
            return None;
        }

        Some(Self {
            network,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix_len)).unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix_len)).unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Proxies whose forwarding headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    ranges: Vec<CidrRange>,
}

impl TrustedProxies {
    /// Build from CIDR strings. Invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }
        Self { ranges }
    }

    /// Whether a trust list is configured.
    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether headers from `peer` may be believed. Everyone is trusted when
    /// no list is configured.
    pub fn is_trusted(&self, peer: &IpAddr) -> bool {
        !self.is_enabled() || self.ranges.iter().any(|range| range.contains(peer))
    }
}

// =============================================================================
// Header Extraction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractedIp {
    /// First entry of X-Forwarded-For
    FromXff(IpAddr),
    FromRealIp(IpAddr),
    NotFound,
}

/// Only values that parse as an address are used; anything else would let a
/// caller mint a fresh rate key per request.
fn extract_ip_from_headers(headers: &HeaderMap) -> ExtractedIp {
    // "client, proxy1, proxy2": the first entry is the original client
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next().map(str::trim)
    {
        match first_ip.parse::<IpAddr>() {
            Ok(ip) => return ExtractedIp::FromXff(ip),
            Err(_) => debug!(value = %first_ip, "Unparseable X-Forwarded-For entry"),
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
    {
        match value.trim().parse::<IpAddr>() {
            Ok(ip) => return ExtractedIp::FromRealIp(ip),
            Err(_) => debug!(value = %value.trim(), "Unparseable X-Real-IP value"),
        }
    }

    ExtractedIp::NotFound
}

/// Resolve the client address used for IP-scoped rate keys.
///
/// `peer` is the TCP peer from `ConnectInfo`, when the server provides it.
pub fn resolve_client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trusted: &TrustedProxies,
) -> Cow<'static, str> {
    let headers_trusted = match &peer {
        Some(peer) => trusted.is_trusted(peer),
        None => !trusted.is_enabled(),
    };

    if headers_trusted {
        match extract_ip_from_headers(headers) {
            ExtractedIp::FromXff(ip) | ExtractedIp::FromRealIp(ip) => {
                return Cow::Owned(ip.to_string());
            }
            ExtractedIp::NotFound => {}
        }
    } else if extract_ip_from_headers(headers) != ExtractedIp::NotFound {
        debug!(
            peer = ?peer,
            "Ignoring proxy headers from untrusted source"
        );
    }

    match peer {
        Some(peer) => Cow::Owned(peer.to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn trusted(cidrs: &[&str]) -> TrustedProxies {
        TrustedProxies::new(&cidrs.iter().map(|c| (*c).to_string()).collect::<Vec<_>>())
    }

    fn peer(ip: &str) -> Option<IpAddr> {
        Some(ip.parse().unwrap())
    }

    #[test]
    fn test_cidr_parsing() {
        assert!(CidrRange::parse("10.0.0.0/8").is_some());
        assert!(CidrRange::parse("192.168.1.1").is_some());
        assert!(CidrRange::parse("::1/128").is_some());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
        assert!(CidrRange::parse("not-an-ip/8").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let range = CidrRange::parse("10.0.0.0/8").unwrap();
        assert!(range.contains(&"10.255.1.2".parse().unwrap()));
        assert!(!range.contains(&"11.0.0.1".parse().unwrap()));
        assert!(!range.contains(&"::1".parse().unwrap()));

        let everything = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(everything.contains(&"203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_xff_first_entry_from_trusted_proxy() {
        let ip = resolve_client_ip(
            &headers(&[("x-forwarded-for", "  203.0.113.50 , 10.0.0.1")]),
            peer("10.0.0.1"),
            &trusted(&["10.0.0.0/8"]),
        );
        assert_eq!(ip, "203.0.113.50");
    }

    #[test]
    fn test_xff_priority_over_real_ip() {
        let ip = resolve_client_ip(
            &headers(&[("x-forwarded-for", "10.0.0.1"), ("x-real-ip", "192.168.1.1")]),
            None,
            &TrustedProxies::default(),
        );
        assert_eq!(ip, "10.0.0.1");
    }

    #[test]
    fn test_untrusted_peer_headers_ignored() {
        let ip = resolve_client_ip(
            &headers(&[("x-forwarded-for", "1.1.1.1")]),
            peer("198.51.100.7"),
            &trusted(&["10.0.0.0/8"]),
        );
        assert_eq!(ip, "198.51.100.7");
    }

    #[test]
    fn test_empty_trust_list_trusts_headers() {
        let ip = resolve_client_ip(
            &headers(&[("x-real-ip", "::1")]),
            peer("198.51.100.7"),
            &TrustedProxies::default(),
        );
        assert_eq!(ip, "::1");
    }

    #[test]
    fn test_peer_used_without_headers() {
        let ip = resolve_client_ip(&HeaderMap::new(), peer("198.51.100.7"), &trusted(&["10.0.0.0/8"]));
        assert_eq!(ip, "198.51.100.7");
    }

    #[test]
    fn test_unknown_without_peer_or_headers() {
        let ip = resolve_client_ip(&HeaderMap::new(), None, &TrustedProxies::default());
        assert_eq!(ip, UNKNOWN_IP);
        assert!(matches!(ip, Cow::Borrowed(_)));
    }

    #[test]
    fn test_headers_ignored_without_peer_when_list_configured() {
        let ip = resolve_client_ip(
            &headers(&[("x-forwarded-for", "1.1.1.1")]),
            None,
            &trusted(&["10.0.0.0/8"]),
        );
        assert_eq!(ip, UNKNOWN_IP);
    }

    #[test]
    fn test_blank_xff_falls_through_to_real_ip() {
        let ip = resolve_client_ip(
            &headers(&[("x-forwarded-for", "   "), ("x-real-ip", "192.168.1.1")]),
            None,
            &TrustedProxies::default(),
        );
        assert_eq!(ip, "192.168.1.1");
    }

    #[test]
    fn test_non_address_header_falls_back_to_peer() {
        let ip = resolve_client_ip(
            &headers(&[("x-forwarded-for", "not-an-ip-12345")]),
            peer("203.0.113.9"),
            &TrustedProxies::default(),
        );
        assert_eq!(ip, "203.0.113.9");

        let ip = resolve_client_ip(
            &headers(&[("x-real-ip", "rl:user:admin")]),
            None,
            &TrustedProxies::default(),
        );
        assert_eq!(ip, UNKNOWN_IP);
    }

    #[test]
    fn test_non_address_xff_falls_through_to_real_ip() {
        let ip = resolve_client_ip(
            &headers(&[("x-forwarded-for", "random-1, 10.0.0.1"), ("x-real-ip", "192.168.1.1")]),
            peer("10.0.0.1"),
            &trusted(&["10.0.0.0/8"]),
        );
        assert_eq!(ip, "192.168.1.1");
    }
}
