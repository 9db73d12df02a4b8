//! Public address discovery.
//!
//! Queried once at startup; the result is appended to forwarded-for chains
//! on outbound requests. Failure is logged and tolerated - the proxy runs
//! without the augmentation rather than refusing to start.

use std::net::IpAddr;
use std::time::Duration;

use tracing::{info, warn};

/// Fetch the proxy's public address from the configured endpoint.
///
/// The endpoint is expected to answer a plain GET with the caller's address
/// as its body. Returns `None` on any failure.
pub async fn discover(endpoint: &str) -> Option<IpAddr> {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Failed to build public-address client");
            return None;
        }
    };

    let body = match client.get(endpoint).send().await {
        Ok(resp) => match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(endpoint, error = %e, "Failed to read public-address response");
                return None;
            }
        },
        Err(e) => {
            warn!(endpoint, error = %e, "Public-address discovery failed (continuing without)");
            return None;
        }
    };

    match body.trim().parse::<IpAddr>() {
        Ok(addr) => {
            info!(addr = %addr, "Discovered public address");
            Some(addr)
        }
        Err(_) => {
            warn!(endpoint, "Public-address endpoint returned something that is not an address");
            None
        }
    }
}
