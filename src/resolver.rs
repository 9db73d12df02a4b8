//! Resolution-time SSRF defense.
//!
//! Hostname policy checks alone cannot prevent DNS rebinding: a hostname can
//! resolve to a safe address at check time and a private one at connect
//! time. [`SafeResolver`] closes that gap by validating every address a
//! resolution returns, and by serving as the upstream connector's DNS
//! resolver, so the addresses actually connected to are exactly the
//! validated ones.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper_util::client::legacy::connect::dns::Name;
use ipnet::IpNet;
use thiserror::Error;
use tower::Service;
use tracing::{debug, warn};

/// Errors from [`SafeResolver`].
#[derive(Error, Debug)]
pub enum ResolveError {
    /// A resolved address landed in a forbidden range.
    #[error("{host} resolves to disallowed address {addr}")]
    AddressRejected { host: String, addr: IpAddr },

    /// Resolution itself failed (NXDOMAIN, resolver error).
    #[error("resolution failed for {host}")]
    ResolutionFailed {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// Resolution succeeded but returned nothing.
    #[error("{host} did not resolve to any address")]
    NoAddresses { host: String },
}

/// True when the address must never be fetched from: RFC1918 private space,
/// loopback, link-local, shared address space (CGNAT), the all-zeros
/// network, broadcast, and their IPv6 counterparts.
pub fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()           // 10/8, 172.16/12, 192.168/16
                || v4.is_loopback()   // 127/8
                || v4.is_link_local() // 169.254/16
                || v4.is_broadcast()
                || v4.octets()[0] == 0 // 0/8, includes 0.0.0.0
                // 100.64/10 (shared address space)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 (unique local)
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                // fe80::/10 (link-local)
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
        }
    }
}

/// Hostname resolver that refuses to hand out disallowed addresses.
///
/// The configured CIDR exceptions re-admit specific ranges (intranet feeds,
/// loopback test rigs); everything else in the disallowed set is rejected.
#[derive(Debug, Clone)]
pub struct SafeResolver {
    allow: Arc<[IpNet]>,
}

impl SafeResolver {
    pub fn new(allow: Vec<IpNet>) -> Self {
        Self {
            allow: allow.into(),
        }
    }

    fn permitted(&self, ip: IpAddr) -> bool {
        !is_disallowed_ip(ip) || self.allow.iter().any(|net| net.contains(&ip))
    }

    /// Resolve a hostname and validate every address it returns.
    ///
    /// The whole resolution is rejected if any returned address is
    /// disallowed, so a host mixing public and private records cannot
    /// smuggle the private one past a first-address check. Literal IP
    /// hosts skip the resolver but not the range check.
    ///
    /// # Errors
    ///
    /// [`ResolveError::AddressRejected`] for a disallowed address,
    /// [`ResolveError::ResolutionFailed`] / [`ResolveError::NoAddresses`]
    /// when resolution errors or comes back empty.
    pub async fn lookup_validated(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Vec<SocketAddr>, ResolveError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            if !self.permitted(ip) {
                warn!(host, addr = %ip, "Rejected literal target address");
                return Err(ResolveError::AddressRejected {
                    host: host.to_string(),
                    addr: ip,
                });
            }
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| ResolveError::ResolutionFailed {
                host: host.to_string(),
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ResolveError::NoAddresses {
                host: host.to_string(),
            });
        }

        for addr in &addrs {
            if !self.permitted(addr.ip()) {
                warn!(host, addr = %addr.ip(), "Rejected resolved address");
                return Err(ResolveError::AddressRejected {
                    host: host.to_string(),
                    addr: addr.ip(),
                });
            }
        }

        debug!(host, count = addrs.len(), "Resolved and validated");
        Ok(addrs)
    }

    /// Resolve and validate, returning the address that will be connected
    /// to first.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, ResolveError> {
        let addrs = self.lookup_validated(host, port).await?;
        // Non-empty by construction.
        Ok(addrs[0])
    }
}

/// Validated addresses handed to the HTTP connector.
pub struct ResolvedAddrs {
    inner: std::vec::IntoIter<SocketAddr>,
}

impl Iterator for ResolvedAddrs {
    type Item = SocketAddr;

    fn next(&mut self) -> Option<SocketAddr> {
        self.inner.next()
    }
}

// DNS resolver plumbing for `HttpConnector::new_with_resolver`. The
// connector takes the port from the URI, so the lookup uses port 0.
impl Service<Name> for SafeResolver {
    type Response = ResolvedAddrs;
    type Error = ResolveError;
    type Future = Pin<Box<dyn Future<Output = Result<ResolvedAddrs, ResolveError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let resolver = self.clone();
        Box::pin(async move {
            let addrs = resolver.lookup_validated(name.as_str(), 0).await?;
            Ok(ResolvedAddrs {
                inner: addrs.into_iter(),
            })
        })
    }
}
