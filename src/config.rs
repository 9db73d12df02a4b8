//! Runtime configuration for the CalGate proxy.
//!
//! All parameters are read from environment variables once at startup and
//! are immutable afterwards. Invalid values log a warning and fall back to
//! the default rather than aborting startup.

use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use tracing::warn;

/// Calendar providers allowed by default. Any subdomain of these suffixes
/// is accepted; the match is anchored at the end of the hostname.
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &[
    "calendar.google.com",
    "googleusercontent.com",
    "outlook.live.com",
    "outlook.office.com",
    "office.com",
    "office365.com",
    "icloud.com",
];

/// Runtime configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port the proxy listens on.
    pub port: u16,

    /// Wall-clock deadline for one outbound exchange, covering connect
    /// through the final response byte.
    pub request_timeout: Duration,

    /// Ceiling applied independently to the request body and the response
    /// body, in bytes.
    pub max_body_bytes: u64,

    /// Maximum requests per rate window for one client identity.
    pub rate_limit: u32,

    /// Length of the rate-limiting window.
    pub rate_window: Duration,

    /// Idle duration after which a client's rate bucket is reclaimed.
    pub rate_stale_after: Duration,

    /// Maximum redirect hops followed for one fetch.
    pub max_redirects: usize,

    /// When set, plain-http targets are denied.
    pub https_only: bool,

    /// Hostname suffixes of permitted calendar providers.
    pub allowed_host_suffixes: Vec<String>,

    /// Hostname labels denied outright (the numeric private-range prefilter
    /// is built in and not configurable).
    pub blocked_host_labels: Vec<String>,

    /// CIDR ranges re-admitted by the resolver despite being private.
    /// Operator opt-in for intranet calendar hosts; empty by default.
    pub resolver_allow: Vec<IpNet>,

    /// Substring the upstream Content-Type must contain. Empty disables the
    /// check.
    pub allowed_content_type: Option<String>,

    /// Origin returned in CORS headers when the request carries none.
    pub cors_origin: String,

    /// Endpoint queried once at startup for the proxy's public address.
    pub public_ip_endpoint: String,

    /// Maximum simultaneous inbound connections.
    pub max_concurrent_connections: usize,

    /// Enable TCP_NODELAY on accepted sockets.
    pub tcp_nodelay: bool,

    /// TCP keepalive interval for accepted sockets, in seconds.
    pub tcp_keepalive_secs: u64,

    /// Maximum idle upstream connections kept per host.
    pub pool_max_idle_per_host: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            request_timeout: Duration::from_secs(10),
            max_body_bytes: 100 * 1024 * 1024, // 100 MB
            rate_limit: 10,
            rate_window: Duration::from_secs(1),
            rate_stale_after: Duration::from_secs(300),
            max_redirects: 3,
            https_only: false,
            allowed_host_suffixes: DEFAULT_ALLOWED_HOSTS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            blocked_host_labels: vec!["metadata".to_string()],
            resolver_allow: Vec::new(),
            allowed_content_type: None,
            cors_origin: "*".to_string(),
            public_ip_endpoint: "https://api.ipify.org".to_string(),
            max_concurrent_connections: 1024,
            tcp_nodelay: true,
            tcp_keepalive_secs: 60,
            pool_max_idle_per_host: 32,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Environment Variables
    ///
    /// - `CALGATE_PORT` (default: 3000)
    /// - `CALGATE_REQUEST_TIMEOUT_SECS` (default: 10)
    /// - `CALGATE_MAX_BODY_BYTES` (default: 104857600 = 100MB)
    /// - `CALGATE_RATE_LIMIT` (default: 10)
    /// - `CALGATE_RATE_WINDOW_SECS` (default: 1)
    /// - `CALGATE_RATE_STALE_SECS` (default: 300)
    /// - `CALGATE_MAX_REDIRECTS` (default: 3)
    /// - `CALGATE_HTTPS_ONLY` (default: false)
    /// - `CALGATE_ALLOWED_HOSTS` (comma-separated suffixes; default: the
    ///   built-in calendar provider list)
    /// - `CALGATE_BLOCKED_LABELS` (comma-separated; default: "metadata")
    /// - `CALGATE_RESOLVER_ALLOW` (comma-separated CIDRs; default: empty)
    /// - `CALGATE_ALLOWED_CONTENT_TYPE` (default: unset = disabled)
    /// - `CALGATE_CORS_ORIGIN` (default: "*")
    /// - `CALGATE_PUBLIC_IP_ENDPOINT` (default: "https://api.ipify.org")
    /// - `CALGATE_MAX_CONCURRENT` (default: 1024)
    /// - `CALGATE_TCP_NODELAY` (default: true)
    /// - `CALGATE_TCP_KEEPALIVE_SECS` (default: 60)
    /// - `CALGATE_POOL_MAX_IDLE` (default: 32)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            port: parse_env_warn("CALGATE_PORT", default.port),

            request_timeout: Duration::from_secs(parse_env_warn(
                "CALGATE_REQUEST_TIMEOUT_SECS",
                default.request_timeout.as_secs(),
            )),

            max_body_bytes: parse_env_warn("CALGATE_MAX_BODY_BYTES", default.max_body_bytes),

            rate_limit: parse_env_warn("CALGATE_RATE_LIMIT", default.rate_limit),

            rate_window: Duration::from_secs(parse_env_warn(
                "CALGATE_RATE_WINDOW_SECS",
                default.rate_window.as_secs(),
            )),

            rate_stale_after: Duration::from_secs(parse_env_warn(
                "CALGATE_RATE_STALE_SECS",
                default.rate_stale_after.as_secs(),
            )),

            max_redirects: parse_env_warn("CALGATE_MAX_REDIRECTS", default.max_redirects),

            https_only: parse_env_warn("CALGATE_HTTPS_ONLY", default.https_only),

            allowed_host_suffixes: parse_list_env(
                "CALGATE_ALLOWED_HOSTS",
                default.allowed_host_suffixes,
            ),

            blocked_host_labels: parse_list_env(
                "CALGATE_BLOCKED_LABELS",
                default.blocked_host_labels,
            ),

            resolver_allow: parse_cidr_env("CALGATE_RESOLVER_ALLOW"),

            allowed_content_type: std::env::var("CALGATE_ALLOWED_CONTENT_TYPE")
                .ok()
                .filter(|v| !v.trim().is_empty()),

            cors_origin: std::env::var("CALGATE_CORS_ORIGIN").unwrap_or(default.cors_origin),

            public_ip_endpoint: std::env::var("CALGATE_PUBLIC_IP_ENDPOINT")
                .unwrap_or(default.public_ip_endpoint),

            max_concurrent_connections: parse_env_warn(
                "CALGATE_MAX_CONCURRENT",
                default.max_concurrent_connections,
            ),

            tcp_nodelay: parse_env_warn("CALGATE_TCP_NODELAY", default.tcp_nodelay),

            tcp_keepalive_secs: parse_env_warn(
                "CALGATE_TCP_KEEPALIVE_SECS",
                default.tcp_keepalive_secs,
            ),

            pool_max_idle_per_host: parse_env_warn(
                "CALGATE_POOL_MAX_IDLE",
                default.pool_max_idle_per_host,
            ),
        }
    }
}

/// Parse an environment variable with a warning on invalid values.
///
/// If the env var is set but cannot be parsed, logs a warning and returns
/// the default. If the env var is not set, returns the default silently.
fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse a comma-separated list, falling back to the default when unset or
/// empty after trimming.
fn parse_list_env(name: &str, default: Vec<String>) -> Vec<String> {
    match std::env::var(name) {
        Ok(val) => {
            let items: Vec<String> = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if items.is_empty() {
                warn!(env_var = name, "Empty list for environment variable, using default");
                default
            } else {
                items
            }
        }
        Err(_) => default,
    }
}

/// Parse a comma-separated CIDR list. Unparseable entries are skipped with
/// a warning so one typo cannot widen or collapse the whole exception set.
fn parse_cidr_env(name: &str) -> Vec<IpNet> {
    let Ok(val) = std::env::var(name) else {
        return Vec::new();
    };
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(_) => {
                // Single host entries are accepted as /32 or /128.
                if let Ok(ip) = s.parse::<IpAddr>() {
                    Some(IpNet::from(ip))
                } else {
                    warn!(env_var = name, entry = %s, "Skipping unparseable CIDR entry");
                    None
                }
            }
        })
        .collect()
}
