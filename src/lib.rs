//! # egress-guard
//!
//! SSRF-safe HTTP client for Rust.
//!
//! `egress-guard` wraps an HTTP client so that every outbound request is
//! validated twice: once on the URL before any I/O (credentials, scheme,
//! host), and again on every numeric address about to be dialed (IPv6,
//! port, address policy). The dial-time check is what defeats DNS
//! rebinding: each hop and each redirect is resolved and checked afresh.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use egress_guard::{Client, Policy};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = Policy::builder()
//!     .allowed_hosts(["api.example.com"])
//!     .build()?;
//! let client = Client::new(policy)?;
//!
//! let response = client.get("https://api.example.com/v1/status").await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```
//!
//! ## What is blocked by default
//!
//! - URLs with a username or password
//! - Schemes other than `http` and `https`
//! - Ports other than `80` and `443`
//! - IPv6 destinations
//! - Loopback, private, link-local, shared, documentation, benchmarking,
//!   multicast, and other reserved ranges (see [`matcher`])
//!
//! A non-empty `allowed_ips` / `allowed_cidrs` list replaces the address
//! checks entirely; see [`PolicyBuilder`].

mod client;
mod error;
mod policy;
mod resolver;

pub mod dial;
pub mod matcher;
pub mod preflight;

pub use client::{Client, ConnectionTracer, Request};
pub use dial::{DialGuard, Network};
pub use error::{find_blocked, ConfigError, Error};
pub use matcher::{addresses, Decision};
pub use policy::{Policy, PolicyBuilder, RedirectCheck, RedirectPolicy};
pub use resolver::{DnsResolver, Resolver, StaticResolver};

pub use reqwest::cookie::Jar;
pub use reqwest::{Method, Response};
