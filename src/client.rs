//! HTTP client that validates every request and every dial.
//!
//! Each hop of a request goes through the same pipeline:
//! 1. Pre-flight checks on the URL (credentials, scheme, host)
//! 2. Name resolution through the configured [`Resolver`]
//! 3. The [`DialGuard`] on every candidate `ip:port`
//! 4. A transport pinned to the addresses that passed
//!
//! Redirects are followed here rather than by the transport, so each hop is
//! resolved and checked again. Validation results are never cached; a
//! transport is only reused for a domain whose fresh answer passed the guard
//! with exactly the same addresses.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Response, StatusCode};
use tokio::time::Instant;
use url::{form_urlencoded, Host, Url};

use crate::dial::DialGuard;
use crate::error::Error;
use crate::policy::{Policy, RedirectPolicy};
use crate::preflight;
use crate::resolver::{DnsResolver, Resolver};

/// Upper bound on cached transports before the cache is flushed.
const MAX_TRANSPORTS: usize = 64;

/// Headers dropped when a redirect leaves the original origin.
const SENSITIVE_HEADERS: &[HeaderName] = &[
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// An outbound request.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

/// Counts DNS resolutions performed by a client in test mode.
///
/// Diagnostic only; it has no effect on what is allowed.
#[derive(Debug, Default)]
pub struct ConnectionTracer {
    dns_resolutions: AtomicUsize,
}

impl ConnectionTracer {
    pub fn dns_resolutions(&self) -> usize {
        self.dns_resolutions.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.dns_resolutions.store(0, Ordering::Relaxed);
    }

    fn record_dns_resolution(&self) {
        self.dns_resolutions.fetch_add(1, Ordering::Relaxed);
    }
}

/// SSRF-safe HTTP client.
///
/// Cheap to clone; clones share the policy, resolver, tracer and transports.
///
/// # Example
///
/// ```rust,no_run
/// use egress_guard::{Client, Error, Policy};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let policy = Policy::builder().allowed_hosts(["example.com"]).build()?;
/// let client = Client::new(policy)?;
///
/// match client.get("http://169.254.169.254/latest/meta-data/").await {
///     Err(Error::HostBlocked { host }) => println!("refused {}", host),
///     other => println!("{:?}", other.map(|r| r.status())),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    policy: Arc<Policy>,
    guard: DialGuard,
    resolver: Arc<dyn Resolver>,
    tracer: Option<Arc<ConnectionTracer>>,
    transports: Arc<Mutex<HashMap<TransportKey, reqwest::Client>>>,
}

/// Pinned domain and its checked addresses; `None` for IP-literal hosts.
type TransportKey = Option<(String, Vec<SocketAddr>)>;

impl Client {
    /// Create a client using the system resolver, or the test nameserver
    /// when the policy is in test mode.
    pub fn new(policy: Policy) -> Result<Self, Error> {
        let resolver: Arc<dyn Resolver> = if policy.test_mode() {
            Arc::new(DnsResolver::with_nameserver(policy.test_resolver_addr()))
        } else {
            Arc::new(DnsResolver::system()?)
        };
        Ok(Self::with_resolver(policy, resolver))
    }

    /// Create a client with an explicit resolver, typically a
    /// [`StaticResolver`](crate::StaticResolver) in tests.
    pub fn with_resolver(policy: Policy, resolver: Arc<dyn Resolver>) -> Self {
        let tracer = policy
            .test_mode()
            .then(|| Arc::new(ConnectionTracer::default()));
        let policy = Arc::new(policy);
        Self {
            guard: DialGuard::new(Arc::clone(&policy)),
            policy,
            resolver,
            tracer,
            transports: Arc::default(),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The DNS tracer, present only in test mode.
    pub fn tracer(&self) -> Option<&ConnectionTracer> {
        self.tracer.as_deref()
    }

    pub async fn get(&self, url: &str) -> Result<Response, Error> {
        self.log_call("get");
        self.execute(Request::new(Method::GET, url)).await
    }

    pub async fn head(&self, url: &str) -> Result<Response, Error> {
        self.log_call("head");
        self.execute(Request::new(Method::HEAD, url)).await
    }

    pub async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<Bytes>,
    ) -> Result<Response, Error> {
        self.log_call("post");
        let request = Request::new(Method::POST, url)
            .header(header::CONTENT_TYPE, HeaderValue::from_str(content_type)?)
            .body(body);
        self.execute(request).await
    }

    /// POST `pairs` as `application/x-www-form-urlencoded`.
    pub async fn post_form<I, K, V>(&self, url: &str, pairs: I) -> Result<Response, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        self.post(url, "application/x-www-form-urlencoded", body)
            .await
    }

    /// Send `request`, following redirects according to the policy.
    ///
    /// The policy timeout bounds the whole exchange: every hop, every
    /// resolution, and reading the final body.
    ///
    /// # Errors
    ///
    /// Returns the first policy violation of any hop, or the transport error
    /// unchanged. A blocked hop never reaches the network. [`Error::Timeout`]
    /// once the policy timeout has elapsed.
    pub async fn execute(&self, request: Request) -> Result<Response, Error> {
        self.log_call("execute");

        let Some(timeout) = self.policy.timeout() else {
            return self.follow(request, None).await;
        };
        let deadline = Instant::now() + timeout;
        tokio::time::timeout_at(deadline, self.follow(request, Some(deadline)))
            .await
            .map_err(|_| Error::Timeout { timeout })?
    }

    async fn follow(
        &self,
        request: Request,
        deadline: Option<Instant>,
    ) -> Result<Response, Error> {
        let Request {
            mut method,
            url,
            mut headers,
            mut body,
        } = request;
        let mut url = Url::parse(&url).map_err(|e| Error::invalid_url(&url, e.to_string()))?;
        let mut visited: Vec<Url> = Vec::new();

        loop {
            preflight::check(&url, &self.policy)?;
            let response = self
                .send(&method, &url, &headers, body.clone(), deadline)
                .await?;

            let status = response.status();
            if !is_followed_redirect(status) {
                return Ok(response);
            }
            let Some(next) = redirect_target(&url, &response)? else {
                return Ok(response);
            };

            visited.push(url.clone());
            match self.policy.redirect() {
                RedirectPolicy::None => return Ok(response),
                RedirectPolicy::Limited(max) => {
                    if visited.len() > *max {
                        return Err(Error::TooManyRedirects { max: *max });
                    }
                }
                RedirectPolicy::Custom(check) => {
                    check(&next, visited.as_slice()).map_err(|reason| Error::RedirectRejected {
                        url: next.to_string(),
                        reason,
                    })?;
                }
            }

            let (next_method, keep_body) = next_hop_method(status, &method);
            method = next_method;
            if !keep_body {
                body = None;
                headers.remove(header::CONTENT_TYPE);
                headers.remove(header::CONTENT_LENGTH);
            }
            if !same_origin(&url, &next) {
                for name in SENSITIVE_HEADERS {
                    headers.remove(name);
                }
            }

            if self.policy.debug_logging() {
                tracing::debug!(from = %url, to = %next, %status, "following redirect");
            }
            url = next;
        }
    }

    /// Send a single hop without following redirects.
    async fn send(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Option<Bytes>,
        deadline: Option<Instant>,
    ) -> Result<Response, Error> {
        let host = url
            .host()
            .ok_or_else(|| Error::invalid_url(url.as_str(), "URL must have a host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::invalid_url(url.as_str(), "URL has no port"))?;

        let addrs = self.plan(&host, port).await?;
        let domain = match host {
            Host::Domain(domain) => Some(domain),
            Host::Ipv4(_) | Host::Ipv6(_) => None,
        };
        let transport = self.transport(domain, &addrs)?;

        let mut request = transport
            .request(method.clone(), url.clone())
            .headers(headers.clone());
        if let Some(body) = body {
            request = request.body(body);
        }
        // The caller reads the body after `execute` returns.
        if let Some(deadline) = deadline {
            request = request.timeout(deadline.saturating_duration_since(Instant::now()));
        }
        Ok(request.send().await?)
    }

    /// Transport pinned to `addrs`, reused while the same checked set comes back.
    fn transport(
        &self,
        domain: Option<&str>,
        addrs: &[SocketAddr],
    ) -> Result<reqwest::Client, Error> {
        let key = domain.map(|domain| (domain.to_string(), addrs.to_vec()));
        let mut transports = self.transports.lock();
        if let Some(client) = transports.get(&key) {
            return Ok(client.clone());
        }

        // Proxies would make the dialed address differ from the checked one.
        let mut builder = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none());
        if let Some(domain) = domain {
            builder = builder.resolve_to_addrs(domain, addrs);
        }
        if let Some(jar) = self.policy.cookie_jar() {
            builder = builder.cookie_provider(Arc::clone(jar));
        }
        let client = builder.build()?;

        if transports.len() >= MAX_TRANSPORTS {
            transports.clear();
        }
        transports.insert(key, client.clone());
        Ok(client)
    }

    /// Resolve `host` and return the candidate addresses the dial guard accepts.
    ///
    /// If every candidate is rejected, the first rejection is returned.
    async fn plan(&self, host: &Host<&str>, port: u16) -> Result<Vec<SocketAddr>, Error> {
        let ips = match host {
            Host::Ipv4(ip) => vec![IpAddr::V4(*ip)],
            Host::Ipv6(ip) => vec![IpAddr::V6(*ip)],
            Host::Domain(domain) => {
                let resolved = self.resolver.resolve(domain).await;
                if let Some(tracer) = &self.tracer {
                    tracer.record_dns_resolution();
                }
                resolved?
            }
        };

        let mut allowed = Vec::with_capacity(ips.len());
        let mut first_rejection = None;
        for ip in ips {
            let addr = SocketAddr::new(ip, port);
            match self.guard.control_addr(addr) {
                Ok(()) => allowed.push(addr),
                Err(e) => {
                    first_rejection.get_or_insert(e);
                }
            }
        }

        match first_rejection {
            Some(e) if allowed.is_empty() => Err(e),
            _ if allowed.is_empty() => Err(Error::dns(host.to_string(), "no IP addresses found")),
            _ => Ok(allowed),
        }
    }

    fn log_call(&self, verb: &str) {
        if self.policy.debug_logging() {
            tracing::debug!(verb, "calling proxied request");
        }
    }
}

fn redirect_target(current: &Url, response: &Response) -> Result<Option<Url>, Error> {
    let Some(location) = response.headers().get(header::LOCATION) else {
        return Ok(None);
    };
    let location = location
        .to_str()
        .map_err(|e| Error::invalid_url(current.as_str(), format!("bad Location header: {}", e)))?;
    current
        .join(location)
        .map(Some)
        .map_err(|e| Error::invalid_url(location, e.to_string()))
}

/// Statuses followed as redirects. Any other 3xx goes back to the caller.
fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Method for the next hop, and whether the body is replayed.
///
/// 301, 302 and 303 turn anything but GET and HEAD into GET and drop the
/// body. 307 and 308 replay the request as is.
fn next_hop_method(status: StatusCode, method: &Method) -> (Method, bool) {
    match status {
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER => {
            let next = match *method {
                Method::GET | Method::HEAD => method.clone(),
                _ => Method::GET,
            };
            (next, false)
        }
        _ => (method.clone(), true),
    }
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}
