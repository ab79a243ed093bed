//! The dial-time guard.
//!
//! [`DialGuard::control`] is called with the numeric address a connection is
//! about to be opened to, after name resolution. Hostnames are not a security
//! boundary: a name that resolved to a public address a moment ago may resolve
//! to `127.0.0.1` now, so the final decision is always made on the address
//! that is actually dialed.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::error::Error;
use crate::matcher::{decide, Decision};
use crate::policy::Policy;

/// Address family of a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp4,
    Tcp6,
}

impl Network {
    /// Family used to dial `ip`. IPv4-mapped IPv6 addresses count as IPv4.
    pub fn of(ip: IpAddr) -> Self {
        match ip.to_canonical() {
            IpAddr::V4(_) => Self::Tcp4,
            IpAddr::V6(_) => Self::Tcp6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection control hook evaluated before every dial.
#[derive(Debug, Clone)]
pub struct DialGuard {
    policy: Arc<Policy>,
}

impl DialGuard {
    pub fn new(policy: Arc<Policy>) -> Self {
        Self { policy }
    }

    /// Decide whether `address` (`ip:port`, IPv6 in brackets) may be dialed.
    ///
    /// Checks run in order: IPv6 gate, port, address policy.
    ///
    /// # Errors
    ///
    /// [`Error::Ipv6Blocked`], [`Error::PortBlocked`], or [`Error::IpBlocked`]
    /// for policy violations. [`Error::MalformedAddress`] if the port is not a
    /// number or the host is not an IP literal, which means the caller skipped
    /// name resolution.
    pub fn control(&self, network: Network, address: &str) -> Result<(), Error> {
        let policy = &self.policy;
        if policy.debug_logging() {
            tracing::debug!(%network, %address, "connection to address");
        }

        // The address itself decides the family too; a caller may mislabel it.
        let family = split_host_port(address)
            .ok()
            .and_then(|(host, _)| host.parse::<IpAddr>().ok())
            .map(Network::of);
        let is_ipv6 = network == Network::Tcp6 || family == Some(Network::Tcp6);
        if is_ipv6 && !policy.ipv6_enabled() {
            if policy.debug_logging() {
                tracing::debug!(%address, "ipv6 is disabled");
            }
            return Err(Error::Ipv6Blocked {
                address: address.to_string(),
            });
        }

        let (host, port) = split_host_port(address)?;

        let port: u16 = port
            .parse()
            .map_err(|_| Error::malformed_address(address, "port is not a number"))?;
        if !policy.is_port_allowed(port) {
            if policy.debug_logging() {
                tracing::debug!(port, "disallowed port");
            }
            return Err(Error::PortBlocked { port });
        }

        let ip: IpAddr = host
            .parse()
            .map_err(|_| Error::malformed_address(address, "host is not an IP address"))?;

        if decide(ip, policy) == Decision::Deny {
            if policy.debug_logging() {
                tracing::debug!(%ip, "ip rejected by address policy");
            }
            return Err(Error::IpBlocked { ip });
        }

        Ok(())
    }

    /// Run [`control`](Self::control) for a socket address.
    pub fn control_addr(&self, addr: SocketAddr) -> Result<(), Error> {
        self.control(Network::of(addr.ip()), &addr.to_string())
    }
}

/// Split `host:port`, accepting `[v6]:port`.
fn split_host_port(address: &str) -> Result<(&str, &str), Error> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| Error::malformed_address(address, "missing ']'"))?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| Error::malformed_address(address, "missing port"))?;
        return Ok((host, port));
    }

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::malformed_address(address, "missing port"))?;
    if host.contains(':') {
        return Err(Error::malformed_address(
            address,
            "IPv6 address must be bracketed",
        ));
    }
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{addresses, RESERVED};

    fn guard(policy: Policy) -> DialGuard {
        DialGuard::new(Arc::new(policy))
    }

    fn default_guard() -> DialGuard {
        guard(Policy::builder().build().unwrap())
    }

    // ==================== Ports ====================

    #[test]
    fn test_default_ports() {
        let g = default_guard();
        assert!(g.control(Network::Tcp4, "93.184.216.34:80").is_ok());
        assert!(g.control(Network::Tcp4, "93.184.216.34:443").is_ok());

        for port in [1u16, 22, 81, 442, 8080, 65535] {
            let err = g
                .control(Network::Tcp4, &format!("93.184.216.34:{}", port))
                .unwrap_err();
            assert!(matches!(err, Error::PortBlocked { port: p } if p == port));
        }
    }

    #[test]
    fn test_port_membership_is_exact() {
        let g = guard(Policy::builder().allowed_ports([8080]).build().unwrap());
        for port in [79u16, 80, 443, 8079, 8080, 8081] {
            let result = g.control(Network::Tcp4, &format!("93.184.216.34:{}", port));
            assert_eq!(result.is_ok(), port == 8080, "port {}", port);
        }
    }

    #[test]
    fn test_port_checked_before_ip() {
        let g = default_guard();
        let err = g.control(Network::Tcp4, "127.0.0.1:8081").unwrap_err();
        assert!(matches!(err, Error::PortBlocked { port: 8081 }));
    }

    // ==================== IPv6 gate ====================

    #[test]
    fn test_ipv6_blocked_before_other_checks() {
        let g = guard(Policy::builder().allowed_ips(["::1"]).build().unwrap());
        // Disallowed port and allow-listed address: the gate still wins.
        let err = g.control(Network::Tcp6, "[::1]:9999").unwrap_err();
        match err {
            Error::Ipv6Blocked { address } => assert_eq!(address, "[::1]:9999"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_ipv6_gate_ignores_mislabeled_network() {
        let g = guard(Policy::builder().allowed_ips(["::1"]).build().unwrap());
        let err = g.control(Network::Tcp4, "[::1]:80").unwrap_err();
        assert!(matches!(err, Error::Ipv6Blocked { .. }));

        // Mapped IPv4 is still IPv4.
        let err = g.control(Network::Tcp4, "[::ffff:127.0.0.1]:80").unwrap_err();
        assert!(matches!(err, Error::IpBlocked { .. }));
    }

    #[test]
    fn test_ipv6_allowed_when_enabled() {
        let g = guard(Policy::builder().enable_ipv6(true).build().unwrap());
        assert!(g.control(Network::Tcp6, "[2606:4700:4700::1111]:443").is_ok());
        let err = g.control(Network::Tcp6, "[::1]:80").unwrap_err();
        assert!(matches!(err, Error::IpBlocked { .. }));
    }

    #[test]
    fn test_mapped_ipv4_dials_as_tcp4() {
        let addr: SocketAddr = "[::ffff:127.0.0.1]:80".parse().unwrap();
        assert_eq!(Network::of(addr.ip()), Network::Tcp4);
        let err = default_guard().control_addr(addr).unwrap_err();
        assert!(matches!(err, Error::IpBlocked { .. }));
    }

    // ==================== Address policy ====================

    #[test]
    fn test_reserved_addresses_blocked() {
        let g = guard(Policy::builder().enable_ipv6(true).build().unwrap());
        for addr in [
            "127.0.0.1:80",
            "0.0.0.0:80",
            "10.0.0.1:80",
            "169.254.169.254:80",
            "192.168.1.1:443",
            "100.64.0.1:80",
            "[::1]:80",
            "[::]:80",
            "[fe80::1]:80",
            "[fd00:ec2::254]:80",
        ] {
            let sock: SocketAddr = addr.parse().unwrap();
            let err = g.control_addr(sock).unwrap_err();
            assert!(matches!(err, Error::IpBlocked { .. }), "{}: {:?}", addr, err);
        }
    }

    #[test]
    fn test_every_reserved_network_blocked() {
        let g = guard(Policy::builder().enable_ipv6(true).build().unwrap());
        for net in RESERVED.iter() {
            for ip in [net.network(), net.broadcast()] {
                let err = g.control_addr(SocketAddr::new(ip, 80)).unwrap_err();
                assert!(
                    matches!(err, Error::IpBlocked { ip: blocked } if blocked == ip),
                    "{} ({}): {:?}",
                    ip,
                    net,
                    err
                );
            }
        }
    }

    #[test]
    fn test_every_address_in_blocked_cidr_rejected() {
        let g = guard(
            Policy::builder()
                .blocked_cidrs(["34.210.62.0/25"])
                .build()
                .unwrap(),
        );

        let mut count = 0;
        for ip in addresses("34.210.62.0/25").unwrap() {
            let err = g.control_addr(SocketAddr::new(ip, 80)).unwrap_err();
            assert!(matches!(err, Error::IpBlocked { ip: blocked } if blocked == ip));
            count += 1;
        }
        assert_eq!(count, 128);

        assert!(g.control(Network::Tcp4, "34.210.62.128:80").is_ok());
    }

    #[test]
    fn test_allow_listed_ip_inside_blocked_cidr() {
        let g = guard(
            Policy::builder()
                .blocked_cidrs(["34.210.62.0/25"])
                .allowed_ips(["34.210.62.107"])
                .build()
                .unwrap(),
        );
        assert!(g.control(Network::Tcp4, "34.210.62.107:80").is_ok());
        assert!(g.control(Network::Tcp4, "34.210.62.108:80").is_err());
    }

    #[test]
    fn test_internal_ip_blocked_with_unrelated_allowlist() {
        let g = guard(
            Policy::builder()
                .blocked_cidrs(["34.210.62.0/25"])
                .allowed_ips(["34.210.62.107"])
                .allowed_ports([8080])
                .build()
                .unwrap(),
        );
        let err = g.control(Network::Tcp4, "127.0.0.1:8080").unwrap_err();
        assert!(matches!(err, Error::IpBlocked { .. }));
    }

    // ==================== Malformed input ====================

    #[test]
    fn test_hostname_at_dial_time_is_malformed() {
        let err = default_guard()
            .control(Network::Tcp4, "service.test:80")
            .unwrap_err();
        assert!(matches!(err, Error::MalformedAddress { .. }));
    }

    #[test]
    fn test_malformed_port() {
        let g = default_guard();
        for addr in ["93.184.216.34:http", "93.184.216.34:70000", "93.184.216.34"] {
            let err = g.control(Network::Tcp4, addr).unwrap_err();
            assert!(matches!(err, Error::MalformedAddress { .. }), "{}", addr);
        }
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("1.2.3.4:80").unwrap(), ("1.2.3.4", "80"));
        assert_eq!(split_host_port("[::1]:443").unwrap(), ("::1", "443"));
        assert!(split_host_port("[::1]").is_err());
        assert!(split_host_port("::1:80").is_err());
    }
}
