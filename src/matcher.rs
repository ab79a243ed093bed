//! Address matching: literal and prefix containment plus the reserved-network table.

use std::net::IpAddr;
use std::sync::LazyLock;

use ipnet::{IpAddrRange, IpNet, Ipv4AddrRange, Ipv6AddrRange};

use crate::error::ConfigError;
use crate::policy::Policy;

/// Networks that are never reachable unless explicitly allow-listed.
///
/// IPv4 ranges follow RFC 5735 and friends; IPv6 ranges follow the IANA
/// special-purpose address registry.
const RESERVED_NETWORKS: &[&str] = &[
    "10.0.0.0/8",         // private, RFC 1918
    "172.16.0.0/12",      // private, RFC 1918
    "192.168.0.0/16",     // private, RFC 1918
    "127.0.0.0/8",        // loopback
    "0.0.0.0/8",          // "this network"
    "169.254.0.0/16",     // link-local, includes cloud metadata
    "192.0.0.0/24",       // IETF protocol assignments
    "192.0.2.0/24",       // TEST-NET-1
    "198.51.100.0/24",    // TEST-NET-2
    "203.0.113.0/24",     // TEST-NET-3
    "192.88.99.0/24",     // 6to4 relay anycast
    "198.18.0.0/15",      // benchmarking
    "224.0.0.0/4",        // multicast
    "240.0.0.0/4",        // reserved (class E)
    "255.255.255.255/32", // broadcast
    "100.64.0.0/10",      // shared address space (CGNAT)
    "::/128",             // unspecified
    "::1/128",            // loopback
    "100::/64",           // discard prefix
    "2001::/23",          // IETF protocol assignments
    "2001:2::/48",        // benchmarking
    "2001:db8::/32",      // documentation
    "2001::/32",          // Teredo
    "fc00::/7",           // unique local
    "fe80::/10",          // link-local
    "ff00::/8",           // multicast
    "2002::/16",          // 6to4
    "64:ff9b::/96",       // IPv4/IPv6 translation
    "2001:10::/28",       // deprecated ORCHID
    "2001:20::/28",       // ORCHIDv2
];

pub(crate) static RESERVED: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    RESERVED_NETWORKS
        .iter()
        .map(|net| {
            net.parse()
                .unwrap_or_else(|e| panic!("reserved network {} does not parse: {}", net, e))
        })
        .collect()
});

/// Outcome of matching a destination address against a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Exact match against a set of literal addresses.
///
/// IPv4-mapped IPv6 addresses compare equal to their IPv4 form.
pub fn contains_literal(ip: IpAddr, set: &[IpAddr]) -> bool {
    let ip = ip.to_canonical();
    set.iter().any(|candidate| candidate.to_canonical() == ip)
}

/// Whether `ip` falls inside any of `prefixes`.
pub fn contains_prefix(ip: IpAddr, prefixes: &[IpNet]) -> bool {
    let ip = ip.to_canonical();
    prefixes.iter().any(|net| net.contains(&ip))
}

/// Whether `ip` is inside the built-in reserved-network table.
pub fn is_reserved(ip: IpAddr) -> bool {
    contains_prefix(ip, &RESERVED)
}

/// Decide whether a resolved destination address may be dialed.
///
/// A configured allowlist is authoritative: when `allowed_ips` or
/// `allowed_cidrs` is non-empty, only addresses matching it are accepted and
/// neither the blocklists nor the reserved table are consulted. This means
/// allow-listing an internal address such as `127.0.0.1` does make it
/// reachable.
pub fn decide(ip: IpAddr, policy: &Policy) -> Decision {
    if policy.has_ip_allowlist() {
        if contains_literal(ip, policy.allowed_ips()) || contains_prefix(ip, policy.allowed_cidrs()) {
            return Decision::Allow;
        }
        return Decision::Deny;
    }

    if contains_literal(ip, policy.blocked_ips())
        || contains_prefix(ip, policy.blocked_cidrs())
        || is_reserved(ip)
    {
        return Decision::Deny;
    }

    Decision::Allow
}

/// Every address inside a CIDR, in ascending order, network and broadcast
/// addresses included.
///
/// The returned range is `Clone`, so it can be replayed. Enumerating a short
/// IPv6 prefix (or `0.0.0.0/0`) is not practical; use it for small ranges.
///
/// ```rust
/// let ips: Vec<_> = egress_guard::addresses("192.168.0.0/30").unwrap().collect();
/// assert_eq!(ips.len(), 4);
/// assert_eq!(ips[0].to_string(), "192.168.0.0");
/// ```
pub fn addresses(cidr: &str) -> Result<IpAddrRange, ConfigError> {
    let net: IpNet = cidr
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidCidr(cidr.to_string()))?;

    Ok(match net {
        IpNet::V4(v4) => IpAddrRange::from(Ipv4AddrRange::new(v4.network(), v4.broadcast())),
        IpNet::V6(v6) => IpAddrRange::from(Ipv6AddrRange::new(v6.network(), v6.broadcast())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_reserved_table_parses() {
        assert_eq!(RESERVED.len(), RESERVED_NETWORKS.len());
    }

    #[test]
    fn test_loopback_reserved() {
        assert!(is_reserved(ip("127.0.0.1")));
        assert!(is_reserved(ip("127.255.255.255")));
        assert!(is_reserved(ip("::1")));
    }

    #[test]
    fn test_private_ranges_reserved() {
        assert!(is_reserved(ip("10.0.0.0")));
        assert!(is_reserved(ip("10.255.255.255")));
        assert!(is_reserved(ip("172.16.0.1")));
        assert!(is_reserved(ip("172.31.255.255")));
        assert!(is_reserved(ip("192.168.1.1")));

        // Just outside the RFC 1918 blocks
        assert!(!is_reserved(ip("9.255.255.255")));
        assert!(!is_reserved(ip("11.0.0.0")));
        assert!(!is_reserved(ip("172.15.255.255")));
        assert!(!is_reserved(ip("172.32.0.0")));
        assert!(!is_reserved(ip("192.167.255.255")));
        assert!(!is_reserved(ip("192.169.0.0")));
    }

    #[test]
    fn test_metadata_and_link_local_reserved() {
        assert!(is_reserved(ip("169.254.169.254")));
        assert!(is_reserved(ip("169.254.1.1")));
        assert!(is_reserved(ip("fe80::1")));
        assert!(is_reserved(ip("fe80::ffff:ffff:ffff:ffff")));
    }

    #[test]
    fn test_special_purpose_reserved() {
        assert!(is_reserved(ip("0.0.0.0")));
        assert!(is_reserved(ip("100.64.0.1")));
        assert!(is_reserved(ip("192.0.2.1")));
        assert!(is_reserved(ip("198.51.100.7")));
        assert!(is_reserved(ip("203.0.113.9")));
        assert!(is_reserved(ip("198.19.255.255")));
        assert!(is_reserved(ip("224.0.0.1")));
        assert!(is_reserved(ip("250.1.2.3")));
        assert!(is_reserved(ip("255.255.255.255")));
        assert!(is_reserved(ip("::")));
        assert!(is_reserved(ip("2001:db8::1")));
        assert!(is_reserved(ip("fd00:ec2::254")));
        assert!(is_reserved(ip("ff02::1")));
        assert!(is_reserved(ip("2002:7f00:1::")));
        assert!(is_reserved(ip("64:ff9b::7f00:1")));
    }

    #[test]
    fn test_public_addresses_not_reserved() {
        assert!(!is_reserved(ip("93.184.216.34")));
        assert!(!is_reserved(ip("8.8.8.8")));
        assert!(!is_reserved(ip("2606:4700:4700::1111")));
        assert!(!is_reserved(ip("2a00:1450:4001:80b::200e")));
    }

    #[test]
    fn test_ipv4_mapped_ipv6_matches_ipv4_ranges() {
        assert!(is_reserved(ip("::ffff:127.0.0.1")));
        assert!(is_reserved(ip("::ffff:192.0.2.1")));
        assert!(is_reserved(ip("::ffff:169.254.169.254")));
        assert!(!is_reserved(ip("::ffff:93.184.216.34")));
    }

    #[test]
    fn test_contains_literal() {
        let set = [ip("34.210.62.107"), ip("::1")];
        assert!(contains_literal(ip("34.210.62.107"), &set));
        assert!(contains_literal(ip("::ffff:34.210.62.107"), &set));
        assert!(contains_literal(ip("0:0:0:0:0:0:0:1"), &set));
        assert!(!contains_literal(ip("34.210.62.108"), &set));
        assert!(!contains_literal(ip("1.1.1.1"), &[]));
    }

    #[test]
    fn test_contains_prefix() {
        let nets: Vec<IpNet> = vec!["34.210.62.0/25".parse().unwrap()];
        assert!(contains_prefix(ip("34.210.62.0"), &nets));
        assert!(contains_prefix(ip("34.210.62.127"), &nets));
        assert!(!contains_prefix(ip("34.210.62.128"), &nets));
        assert!(!contains_prefix(ip("2001:db8::1"), &nets));
    }

    #[test]
    fn test_decide_defaults() {
        let policy = Policy::builder().build().unwrap();
        assert_eq!(decide(ip("93.184.216.34"), &policy), Decision::Allow);
        assert_eq!(decide(ip("127.0.0.1"), &policy), Decision::Deny);
        assert_eq!(decide(ip("::ffff:10.0.0.1"), &policy), Decision::Deny);
    }

    #[test]
    fn test_decide_blocklists() {
        let policy = Policy::builder()
            .blocked_ips(["8.8.8.8"])
            .blocked_cidrs(["34.210.62.0/25"])
            .build()
            .unwrap();

        assert_eq!(decide(ip("8.8.8.8"), &policy), Decision::Deny);
        assert_eq!(decide(ip("34.210.62.21"), &policy), Decision::Deny);
        assert_eq!(decide(ip("8.8.4.4"), &policy), Decision::Allow);
        assert_eq!(decide(ip("127.0.0.1"), &policy), Decision::Deny);
    }

    #[test]
    fn test_decide_allowlist_is_authoritative() {
        let policy = Policy::builder()
            .allowed_cidrs(["34.210.62.0/25"])
            .build()
            .unwrap();

        assert_eq!(decide(ip("34.210.62.107"), &policy), Decision::Allow);
        // Public, unlisted: fail closed
        assert_eq!(decide(ip("172.217.14.195"), &policy), Decision::Deny);
        assert_eq!(decide(ip("127.0.0.1"), &policy), Decision::Deny);
    }

    #[test]
    fn test_decide_allow_overrides_block_and_reserved() {
        let policy = Policy::builder()
            .blocked_cidrs(["34.210.62.0/25"])
            .allowed_ips(["34.210.62.107", "127.0.0.1"])
            .build()
            .unwrap();

        assert_eq!(decide(ip("34.210.62.107"), &policy), Decision::Allow);
        assert_eq!(decide(ip("127.0.0.1"), &policy), Decision::Allow);
        assert_eq!(decide(ip("34.210.62.108"), &policy), Decision::Deny);
    }

    #[test]
    fn test_addresses_enumerates_whole_prefix() {
        let ips: Vec<IpAddr> = addresses("34.210.62.0/25").unwrap().collect();
        assert_eq!(ips.len(), 128);
        assert_eq!(ips.first(), Some(&ip("34.210.62.0")));
        assert_eq!(ips.last(), Some(&ip("34.210.62.127")));
        assert!(ips.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_addresses_masks_host_bits_and_restarts() {
        let range = addresses("192.168.0.5/30").unwrap();
        let first: Vec<IpAddr> = range.clone().collect();
        let second: Vec<IpAddr> = range.collect();
        assert_eq!(
            first,
            vec![
                ip("192.168.0.4"),
                ip("192.168.0.5"),
                ip("192.168.0.6"),
                ip("192.168.0.7")
            ]
        );
        assert_eq!(first, second);
    }

    #[test]
    fn test_addresses_single_and_ipv6() {
        assert_eq!(addresses("10.0.0.1/32").unwrap().count(), 1);
        let v6: Vec<IpAddr> = addresses("2001:db8::/126").unwrap().collect();
        assert_eq!(v6.len(), 4);
        assert_eq!(v6[3], ip("2001:db8::3"));
    }

    #[test]
    fn test_addresses_rejects_garbage() {
        assert_eq!(
            addresses("not-a-cidr").unwrap_err(),
            ConfigError::InvalidCidr("not-a-cidr".to_string())
        );
    }
}
