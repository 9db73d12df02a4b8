//! CalGate - hardened forwarding proxy for remote calendar (.ics) feeds.
//!
//! This crate contains the request validation and safe-forwarding pipeline:
//! target policy checks, resolution-time SSRF defense, redirect
//! re-validation, streaming size enforcement, and per-client rate limiting,
//! plus the HTTP transport layer that wires them together.

pub mod body_limit;
pub mod config;
pub mod cors;
pub mod error;
pub mod logging_layer;
pub mod policy;
pub mod proxy_service;
pub mod public_ip;
pub mod rate_limiter;
pub mod redirect;
pub mod resolver;
pub mod server;
pub mod timeout;

pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use policy::PolicyEvaluator;
pub use proxy_service::ProxyService;
pub use rate_limiter::ClientRateLimiter;
pub use resolver::SafeResolver;
