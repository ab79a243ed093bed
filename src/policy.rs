//! Egress policy and its builder.
//!
//! ## Immutability
//!
//! Once built via [`PolicyBuilder::build()`], a [`Policy`] cannot be modified.
//! The builder consumes `self` on each method call, and `build()` is the only
//! place where input is normalized and validated. Malformed ports, IPs, or
//! CIDRs are reported as a [`ConfigError`] at build time; nothing is silently
//! dropped.
//!
//! ## Security Considerations
//!
//! **Be careful with `allowed_ips` / `allowed_cidrs`.** A non-empty address
//! allowlist is the only thing consulted at dial time, so it overrides the
//! blocklists and the reserved-network table:
//!
//! ```rust
//! use egress_guard::Policy;
//!
//! // DANGEROUS: this makes loopback reachable.
//! let policy = Policy::builder()
//!     .allowed_cidrs(["127.0.0.0/8"])
//!     .build()
//!     .unwrap();
//! # let _ = policy;
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use reqwest::cookie::Jar;
use url::Url;

use crate::error::ConfigError;

const DEFAULT_SCHEMES: &[&str] = &["http", "https"];
const DEFAULT_PORTS: &[u16] = &[80, 443];
const DEFAULT_MAX_REDIRECTS: usize = 10;
const DEFAULT_TEST_RESOLVER_PORT: u16 = 8053;

/// Callback deciding whether a redirect may be followed.
///
/// Receives the next URL and the URLs already visited, oldest first.
pub type RedirectCheck = dyn Fn(&Url, &[Url]) -> Result<(), String> + Send + Sync;

/// How the client follows redirects.
///
/// Every followed hop is validated again, whatever the policy says.
#[derive(Clone)]
pub enum RedirectPolicy {
    /// Return the redirect response to the caller.
    None,
    /// Follow up to this many redirects.
    Limited(usize),
    /// Ask a callback before each redirect.
    Custom(Arc<RedirectCheck>),
}

impl RedirectPolicy {
    /// Build a [`RedirectPolicy::Custom`] from a closure.
    pub fn custom<F>(check: F) -> Self
    where
        F: Fn(&Url, &[Url]) -> Result<(), String> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(check))
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::Limited(DEFAULT_MAX_REDIRECTS)
    }
}

impl fmt::Debug for RedirectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Limited(max) => f.debug_tuple("Limited").field(max).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A validated egress policy.
///
/// Created via [`PolicyBuilder`]. Holds the scheme, host, port and address
/// rules every request is checked against, plus transport settings that are
/// handed to the HTTP client untouched.
///
/// # Precedence
///
/// For a resolved destination address:
/// 1. If an address allowlist is configured, the address must match it.
/// 2. Otherwise the address must not match a blocklist or the reserved table.
#[derive(Clone)]
pub struct Policy {
    allowed_schemes: HashSet<String>,
    allowed_ports: BTreeSet<u16>,
    allowed_hosts: Option<HashSet<String>>,
    allowed_ips: Vec<IpAddr>,
    blocked_ips: Vec<IpAddr>,
    allowed_cidrs: Vec<IpNet>,
    blocked_cidrs: Vec<IpNet>,
    allow_credentials: bool,
    ipv6_enabled: bool,
    debug_logging: bool,
    test_mode: bool,
    test_resolver_addr: SocketAddr,
    timeout: Option<Duration>,
    redirect: RedirectPolicy,
    cookie_jar: Option<Arc<Jar>>,
}

impl Policy {
    /// Start building a policy.
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::new()
    }

    pub fn allowed_schemes(&self) -> &HashSet<String> {
        &self.allowed_schemes
    }

    pub fn allowed_ports(&self) -> &BTreeSet<u16> {
        &self.allowed_ports
    }

    /// `None` means no host restriction; `Some` of an empty set blocks every host.
    pub fn allowed_hosts(&self) -> Option<&HashSet<String>> {
        self.allowed_hosts.as_ref()
    }

    pub fn allowed_ips(&self) -> &[IpAddr] {
        &self.allowed_ips
    }

    pub fn blocked_ips(&self) -> &[IpAddr] {
        &self.blocked_ips
    }

    pub fn allowed_cidrs(&self) -> &[IpNet] {
        &self.allowed_cidrs
    }

    pub fn blocked_cidrs(&self) -> &[IpNet] {
        &self.blocked_cidrs
    }

    /// Whether an address allowlist is in force.
    pub fn has_ip_allowlist(&self) -> bool {
        !self.allowed_ips.is_empty() || !self.allowed_cidrs.is_empty()
    }

    pub fn allow_credentials(&self) -> bool {
        self.allow_credentials
    }

    pub fn ipv6_enabled(&self) -> bool {
        self.ipv6_enabled
    }

    pub fn debug_logging(&self) -> bool {
        self.debug_logging
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    /// Nameserver queried instead of the system resolver in test mode.
    pub fn test_resolver_addr(&self) -> SocketAddr {
        self.test_resolver_addr
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn redirect(&self) -> &RedirectPolicy {
        &self.redirect
    }

    pub fn cookie_jar(&self) -> Option<&Arc<Jar>> {
        self.cookie_jar.as_ref()
    }

    pub(crate) fn is_scheme_allowed(&self, scheme: &str) -> bool {
        self.allowed_schemes.contains(&scheme.to_lowercase())
    }

    pub(crate) fn is_port_allowed(&self, port: u16) -> bool {
        self.allowed_ports.contains(&port)
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allowed_schemes: DEFAULT_SCHEMES.iter().map(|s| s.to_string()).collect(),
            allowed_ports: DEFAULT_PORTS.iter().copied().collect(),
            allowed_hosts: None,
            allowed_ips: Vec::new(),
            blocked_ips: Vec::new(),
            allowed_cidrs: Vec::new(),
            blocked_cidrs: Vec::new(),
            allow_credentials: false,
            ipv6_enabled: false,
            debug_logging: false,
            test_mode: false,
            test_resolver_addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                DEFAULT_TEST_RESOLVER_PORT,
            ),
            timeout: None,
            redirect: RedirectPolicy::default(),
            cookie_jar: None,
        }
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("allowed_schemes", &self.allowed_schemes)
            .field("allowed_ports", &self.allowed_ports)
            .field("allowed_hosts", &self.allowed_hosts)
            .field("allowed_ips", &self.allowed_ips)
            .field("blocked_ips", &self.blocked_ips)
            .field("allowed_cidrs", &self.allowed_cidrs)
            .field("blocked_cidrs", &self.blocked_cidrs)
            .field("allow_credentials", &self.allow_credentials)
            .field("ipv6_enabled", &self.ipv6_enabled)
            .field("debug_logging", &self.debug_logging)
            .field("test_mode", &self.test_mode)
            .field("timeout", &self.timeout)
            .field("redirect", &self.redirect)
            .field("cookie_jar", &self.cookie_jar.is_some())
            .finish()
    }
}

/// Builder for [`Policy`].
///
/// Every list setter replaces what was set before. Unset lists keep their
/// defaults: schemes `http`/`https`, ports `80`/`443`, no host restriction,
/// no address allow- or blocklists.
#[derive(Clone, Default)]
pub struct PolicyBuilder {
    timeout: Option<Duration>,
    redirect: Option<RedirectPolicy>,
    cookie_jar: Option<Arc<Jar>>,
    allowed_schemes: Option<Vec<String>>,
    allowed_hosts: Option<Vec<String>>,
    allowed_ports: Option<Vec<i64>>,
    allowed_ips: Vec<String>,
    blocked_ips: Vec<String>,
    allowed_cidrs: Vec<String>,
    blocked_cidrs: Vec<String>,
    allow_credentials: bool,
    ipv6_enabled: bool,
    debug_logging: bool,
    test_mode: bool,
    test_resolver_addr: Option<SocketAddr>,
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overall request timeout, enforced by the HTTP transport.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn redirect(mut self, policy: RedirectPolicy) -> Self {
        self.redirect = Some(policy);
        self
    }

    pub fn cookie_jar(mut self, jar: Arc<Jar>) -> Self {
        self.cookie_jar = Some(jar);
        self
    }

    /// Schemes that may be requested. Matching is case-insensitive.
    pub fn allowed_schemes<I, S>(mut self, schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_schemes = Some(schemes.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict requests to these hostnames (exact, case-insensitive).
    ///
    /// Passing an empty list blocks every host.
    pub fn allowed_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_hosts = Some(hosts.into_iter().map(Into::into).collect());
        self
    }

    /// Destination ports that may be dialed. Each must be in `1..=65535`.
    ///
    /// # Example
    /// ```
    /// use egress_guard::Policy;
    ///
    /// assert!(Policy::builder().allowed_ports([8080, 8443]).build().is_ok());
    /// assert!(Policy::builder().allowed_ports([0]).build().is_err());
    /// ```
    pub fn allowed_ports<I, P>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<i64>,
    {
        self.allowed_ports = Some(ports.into_iter().map(Into::into).collect());
        self
    }

    /// Literal addresses that may be dialed. Makes the address allowlist authoritative.
    pub fn allowed_ips<I, S>(mut self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_ips = ips.into_iter().map(Into::into).collect();
        self
    }

    /// Literal addresses that may never be dialed.
    pub fn blocked_ips<I, S>(mut self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_ips = ips.into_iter().map(Into::into).collect();
        self
    }

    /// Address ranges that may be dialed. Makes the address allowlist authoritative.
    pub fn allowed_cidrs<I, S>(mut self, cidrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_cidrs = cidrs.into_iter().map(Into::into).collect();
        self
    }

    /// Address ranges that may never be dialed.
    ///
    /// # Example
    /// ```
    /// use egress_guard::Policy;
    ///
    /// let policy = Policy::builder()
    ///     .blocked_cidrs(["34.210.62.0/25"])
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(policy.blocked_cidrs().len(), 1);
    /// ```
    pub fn blocked_cidrs<I, S>(mut self, cidrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_cidrs = cidrs.into_iter().map(Into::into).collect();
        self
    }

    /// Allow connections to IPv6 destinations. Off by default.
    pub fn enable_ipv6(mut self, enable: bool) -> Self {
        self.ipv6_enabled = enable;
        self
    }

    /// Log every rejection at `debug` level.
    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Allow `user:pass@` in request URLs. Off by default.
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    /// Resolve names through the test nameserver and count resolutions.
    pub fn test_mode(mut self, enable: bool) -> Self {
        self.test_mode = enable;
        self
    }

    /// Nameserver used in test mode. Defaults to `127.0.0.1:8053`.
    pub fn test_resolver_addr(mut self, addr: SocketAddr) -> Self {
        self.test_resolver_addr = Some(addr);
        self
    }

    /// Normalize and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for the first port, IP, or CIDR that does not
    /// parse.
    pub fn build(self) -> Result<Policy, ConfigError> {
        let defaults = Policy::default();

        let allowed_schemes = match self.allowed_schemes {
            Some(schemes) => schemes.iter().map(|s| normalize_name(s)).collect(),
            None => defaults.allowed_schemes,
        };

        let allowed_hosts = self
            .allowed_hosts
            .map(|hosts| hosts.iter().map(|h| normalize_host(h)).collect());

        let allowed_ports = match self.allowed_ports {
            Some(ports) => ports
                .into_iter()
                .map(parse_port)
                .collect::<Result<BTreeSet<u16>, _>>()?,
            None => defaults.allowed_ports,
        };

        Ok(Policy {
            allowed_schemes,
            allowed_ports,
            allowed_hosts,
            allowed_ips: parse_ips(&self.allowed_ips)?,
            blocked_ips: parse_ips(&self.blocked_ips)?,
            allowed_cidrs: parse_cidrs(&self.allowed_cidrs)?,
            blocked_cidrs: parse_cidrs(&self.blocked_cidrs)?,
            allow_credentials: self.allow_credentials,
            ipv6_enabled: self.ipv6_enabled,
            debug_logging: self.debug_logging,
            test_mode: self.test_mode,
            test_resolver_addr: self
                .test_resolver_addr
                .unwrap_or(defaults.test_resolver_addr),
            timeout: self.timeout,
            redirect: self.redirect.unwrap_or_default(),
            cookie_jar: self.cookie_jar,
        })
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Lowercase, trim, and drop a trailing dot (FQDN notation).
pub(crate) fn normalize_host(host: &str) -> String {
    let mut normalized = normalize_name(host);
    if normalized.ends_with('.') {
        normalized.pop();
    }
    normalized
}

fn parse_port(port: i64) -> Result<u16, ConfigError> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ConfigError::InvalidPort(port)),
    }
}

fn parse_ips(ips: &[String]) -> Result<Vec<IpAddr>, ConfigError> {
    ips.iter()
        .map(|raw| {
            let trimmed = raw.trim();
            let literal = trimmed
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .unwrap_or(trimmed);
            literal
                .parse::<IpAddr>()
                .map(|ip| ip.to_canonical())
                .map_err(|_| ConfigError::InvalidIp(raw.clone()))
        })
        .collect()
}

fn parse_cidrs(cidrs: &[String]) -> Result<Vec<IpNet>, ConfigError> {
    cidrs
        .iter()
        .map(|raw| {
            raw.trim()
                .parse::<IpNet>()
                .map(|net| net.trunc())
                .map_err(|_| ConfigError::InvalidCidr(raw.clone()))
        })
        .collect()
}
