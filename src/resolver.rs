//! Name resolution.
//!
//! The client resolves names itself so that every address handed to the
//! transport has gone through the dial guard. Resolution is pluggable for
//! tests: [`StaticResolver`] answers from memory, and test mode points
//! [`DnsResolver`] at a local nameserver.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use parking_lot::Mutex;

use crate::error::Error;

/// Resolves a hostname to candidate addresses, in preference order.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, Error>;
}

/// DNS resolver backed by hickory.
pub struct DnsResolver {
    inner: TokioResolver,
}

impl DnsResolver {
    /// Use the system resolver configuration.
    pub fn system() -> Result<Self, Error> {
        let inner = TokioResolver::builder_tokio()
            .map_err(|e| Error::dns("system", e.to_string()))?
            .build();
        Ok(Self { inner })
    }

    /// Send every query to a single plain-UDP/TCP nameserver.
    pub fn with_nameserver(addr: SocketAddr) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let inner =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build();
        Self { inner }
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        if let Some(ip) = parse_literal(host) {
            return Ok(vec![ip]);
        }

        let response = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|e| Error::dns(host, e.to_string()))?;

        let ips: Vec<IpAddr> = response.iter().collect();
        if ips.is_empty() {
            return Err(Error::dns(host, "no IP addresses found"));
        }
        Ok(ips)
    }
}

/// In-memory resolver for tests.
///
/// Each host has a sequence of answers. Every lookup returns the next answer
/// and the last one repeats, which makes rebinding easy to script:
///
/// ```rust
/// use egress_guard::StaticResolver;
///
/// let resolver = StaticResolver::new()
///     .answer("rebind.test", ["93.184.216.34".parse().unwrap()])
///     .answer("rebind.test", ["127.0.0.1".parse().unwrap()]);
/// # let _ = resolver;
/// ```
#[derive(Debug, Default)]
pub struct StaticResolver {
    answers: HashMap<String, Vec<Vec<IpAddr>>>,
    lookups: Mutex<HashMap<String, usize>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an answer for `host`.
    pub fn answer<I>(mut self, host: &str, ips: I) -> Self
    where
        I: IntoIterator<Item = IpAddr>,
    {
        self.answers
            .entry(host.to_lowercase())
            .or_default()
            .push(ips.into_iter().collect());
        self
    }

    /// How many times `host` has been looked up.
    pub fn lookups(&self, host: &str) -> usize {
        self.lookups
            .lock()
            .get(&host.to_lowercase())
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        if let Some(ip) = parse_literal(host) {
            return Ok(vec![ip]);
        }

        let key = host.to_lowercase();
        let answers = self
            .answers
            .get(&key)
            .ok_or_else(|| Error::dns(host, "no records"))?;

        let index = {
            let mut lookups = self.lookups.lock();
            let count = lookups.entry(key).or_insert(0);
            let index = *count;
            *count += 1;
            index
        };

        let ips = answers
            .get(index)
            .or_else(|| answers.last())
            .cloned()
            .unwrap_or_default();
        if ips.is_empty() {
            return Err(Error::dns(host, "no IP addresses found"));
        }
        Ok(ips)
    }
}

fn parse_literal(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}
