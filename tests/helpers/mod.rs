//! Shared helpers for integration tests.
//!
//! Note: some helpers are provided for future test expansion and may not be
//! used by every test binary.

#![allow(dead_code)]

pub mod mock_feed;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use calgate::config::ProxyConfig;
use calgate::proxy_service::ProxyService;
use calgate::rate_limiter::ClientRateLimiter;
use calgate::server;

/// Handle to a proxy running on an ephemeral port.
pub struct ProxyHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Configuration for a proxy fetching from a loopback mock feed.
///
/// The allowlist admits "localhost" and the resolver re-admits loopback so
/// end-to-end scenarios can run without touching the network. Rate limiting
/// is parked out of the way; tests about it tighten the cap themselves.
pub fn loopback_config() -> ProxyConfig {
    ProxyConfig {
        allowed_host_suffixes: vec!["localhost".to_string()],
        resolver_allow: vec![
            "127.0.0.0/8".parse().unwrap(),
            "::1/128".parse().unwrap(),
        ],
        rate_limit: 1000,
        rate_window: Duration::from_secs(1),
        max_body_bytes: mock_feed::BODY_LIMIT,
        request_timeout: Duration::from_secs(5),
        ..ProxyConfig::default()
    }
}

/// Start a proxy with the given configuration and return its address.
pub async fn spawn_proxy(config: ProxyConfig, public_ip: Option<IpAddr>) -> ProxyHandle {
    let config = Arc::new(config);
    let limiter = Arc::new(ClientRateLimiter::new(
        config.rate_limit,
        config.rate_window,
        config.rate_stale_after,
    ));
    let service =
        ProxyService::new(config.clone(), limiter, public_ip).expect("failed to build service");

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind proxy listener");
    let addr = listener.local_addr().expect("listener has no local addr");

    let shutdown = CancellationToken::new();
    let run_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = server::run(listener, service, config, run_shutdown).await;
    });

    ProxyHandle { addr, shutdown }
}

/// Test client that never follows redirects on its own - redirect handling
/// belongs to the proxy under test.
pub fn test_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("failed to build test client")
}

/// Build the proxy fetch URL for a target.
pub fn fetch_url(proxy: SocketAddr, target: &str) -> String {
    format!("http://{proxy}/fetch/{}", urlencoding::encode(target))
}

/// Build a target URL pointing at the mock feed.
pub fn feed_target(feed: SocketAddr, path: &str) -> String {
    format!("http://localhost:{}{}", feed.port(), path)
}
