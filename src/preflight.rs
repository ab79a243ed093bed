//! Checks run on the parsed URL before any network I/O.
//!
//! The order is fixed: credentials, then scheme, then host. The first
//! failure is returned and no connection is attempted.

use url::{Host, Url};

use crate::error::Error;
use crate::policy::{normalize_host, Policy};

/// Run every pre-flight check against `url`.
pub fn check(url: &Url, policy: &Policy) -> Result<(), Error> {
    check_credentials(url, policy)?;
    check_scheme(url, policy)?;
    check_host(url, policy)?;
    Ok(())
}

/// Reject `user:pass@` unless the policy allows credentials.
pub fn check_credentials(url: &Url, policy: &Policy) -> Result<(), Error> {
    if policy.allow_credentials() {
        return Ok(());
    }

    let has_username = !url.username().trim().is_empty();
    let has_password = url.password().is_some_and(|p| !p.trim().is_empty());

    if has_username || has_password {
        if policy.debug_logging() {
            tracing::debug!(url = %redact(url), "credentials found in supplied url");
        }
        return Err(Error::CredentialsBlocked);
    }

    Ok(())
}

pub fn check_scheme(url: &Url, policy: &Policy) -> Result<(), Error> {
    let scheme = url.scheme();
    if !scheme.is_empty() && !policy.is_scheme_allowed(scheme) {
        if policy.debug_logging() {
            tracing::debug!(%scheme, "disallowed scheme");
        }
        return Err(Error::SchemeBlocked {
            scheme: scheme.to_string(),
        });
    }
    Ok(())
}

/// Reject hosts missing from a configured host allowlist.
///
/// Matching is exact and case-insensitive; there is no wildcard support.
pub fn check_host(url: &Url, policy: &Policy) -> Result<(), Error> {
    let Some(allowed) = policy.allowed_hosts() else {
        return Ok(());
    };

    let host = hostname(url);
    if !allowed.contains(&normalize_host(&host)) {
        if policy.debug_logging() {
            tracing::debug!(%host, "disallowed host");
        }
        return Err(Error::HostBlocked { host });
    }

    Ok(())
}

/// Hostname without IPv6 brackets, or an empty string if the URL has none.
pub(crate) fn hostname(url: &Url) -> String {
    match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => String::new(),
    }
}

/// URL with the userinfo stripped, safe to log.
fn redact(url: &Url) -> String {
    let mut redacted = url.clone();
    let _ = redacted.set_username("");
    let _ = redacted.set_password(None);
    redacted.to_string()
}
