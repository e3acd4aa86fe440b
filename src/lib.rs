//! Straylight — a policy-gated, resilient outbound HTTP client layer.
//!
//! Built for autonomous-agent runtimes: every network call an agent makes
//! is risk-scored by a [`guardian::Guardian`] against a declarative
//! [`policy::Policy`], throttled by a [`ratelimit::RateLimiter`], served
//! from (or stored into) a [`cache::ResponseCache`], and carried by the
//! [`client::HttpClient`] with bounded retries of transport failures.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod client;
pub mod config;
pub mod guardian;
pub mod logging;
pub mod policy;
pub mod ratelimit;
