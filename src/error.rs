//! Error types for egress-guard.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors produced while building a [`Policy`](crate::Policy).
///
/// These are programmer errors in the supplied configuration and are
/// reported once, at startup, instead of surfacing on every request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Port outside `1..=65535`.
    #[error("invalid port: {0}")]
    InvalidPort(i64),

    /// IP literal that could not be parsed.
    #[error("error parsing ip: {0}")]
    InvalidIp(String),

    /// CIDR prefix that could not be parsed.
    #[error("error parsing cidr: {0}")]
    InvalidCidr(String),
}

/// Errors returned for a single outbound request.
#[derive(Debug, Error)]
pub enum Error {
    /// The URL carries a username or password and credentials are not allowed.
    #[error("sending credentials blocked")]
    CredentialsBlocked,

    /// Scheme not in the allowed set.
    #[error("scheme: {scheme} not found in allowlist")]
    SchemeBlocked { scheme: String },

    /// Hostname not in the configured host allowlist.
    #[error("host: {host} not found in allowlist")]
    HostBlocked { host: String },

    /// IPv6 destination while IPv6 is disabled.
    #[error("ipv6 blocked. connection to {address} dropped")]
    Ipv6Blocked { address: String },

    /// Destination port not in the allowed set.
    #[error("port: {port} not found in allowlist")]
    PortBlocked { port: u16 },

    /// Destination address rejected by the address policy.
    #[error("ip: {ip} blocked by address policy")]
    IpBlocked { ip: IpAddr },

    /// The URL could not be parsed or has no usable host.
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The dial hook was handed something other than a numeric `ip:port`.
    #[error("malformed dial address {address}: {reason}")]
    MalformedAddress { address: String, reason: String },

    /// Name resolution failed.
    #[error("DNS error for {host}: {message}")]
    Dns { host: String, message: String },

    /// Redirect limit exceeded.
    #[error("too many redirects (max {max})")]
    TooManyRedirects { max: usize },

    /// A custom redirect policy refused to follow a redirect.
    #[error("redirect to {url} rejected: {reason}")]
    RedirectRejected { url: String, reason: String },

    /// The request, redirects and resolution included, outlived the
    /// configured timeout.
    #[error("request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// A header value supplied with the request is not valid.
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    /// Transport failure, passed through unchanged.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether this error is a policy violation rather than a transport
    /// or input failure.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            Self::CredentialsBlocked
                | Self::SchemeBlocked { .. }
                | Self::HostBlocked { .. }
                | Self::Ipv6Blocked { .. }
                | Self::PortBlocked { .. }
                | Self::IpBlocked { .. }
        )
    }

    /// Whether the request ran out of time, either as a whole or inside
    /// the transport.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Http(e) => e.is_timeout(),
            _ => false,
        }
    }

    pub(crate) fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn dns(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dns {
            host: host.into(),
            message: message.into(),
        }
    }
}

/// Find the first policy violation in an error chain.
///
/// Callers that wrap [`Error`] in their own types (or in `Box<dyn Error>`)
/// can use this to recover the original kind.
///
/// ```rust
/// use egress_guard::{find_blocked, Error};
///
/// let err: Box<dyn std::error::Error> = Box::new(Error::CredentialsBlocked);
/// assert!(matches!(find_blocked(err.as_ref()), Some(Error::CredentialsBlocked)));
/// ```
pub fn find_blocked<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a Error> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<Error>() {
            if found.is_blocked() {
                return Some(found);
            }
        }
        current = e.source();
    }
    None
}
