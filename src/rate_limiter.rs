//! Per-client rate limiting.
//!
//! Each client identity gets its own GCRA rate limiter, created lazily on
//! first request and reclaimed once idle. The identity is the first
//! forwarded-for entry when present, the transport peer address otherwise;
//! it is only ever used as a bucket key, never persisted.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use http::HeaderMap;
use tracing::{debug, info};

/// Type alias for one client's governor rate limiter.
type BucketLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Entry in the per-client limiter map.
struct Bucket {
    limiter: BucketLimiter,
    last_seen: Instant,
}

/// Derive the rate-limit identity for a request: the first entry of an
/// existing forwarded-for chain, or the transport peer.
pub fn client_identity(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .and_then(|s| s.parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer.ip())
}

/// Per-client rate limiter.
///
/// Wraps a `DashMap` of per-identity governor limiters. The quota admits at
/// most `max_per_window` requests in any `window`-long span (burst equals
/// the cap, replenishment spreads across the window). Stale buckets are
/// removed by a background task so the map cannot grow without bound.
pub struct ClientRateLimiter {
    buckets: Arc<DashMap<IpAddr, Bucket>>,
    quota: Quota,
    stale_after: Duration,
}

impl ClientRateLimiter {
    /// Create a limiter admitting `max_per_window` requests per `window`.
    pub fn new(max_per_window: u32, window: Duration, stale_after: Duration) -> Self {
        let cap = NonZeroU32::new(max_per_window).unwrap_or(NonZeroU32::MIN);
        let period = window / cap.get();
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(cap))
            .allow_burst(cap);

        info!(
            max_per_window = cap.get(),
            window_ms = window.as_millis() as u64,
            stale_secs = stale_after.as_secs(),
            "Per-client rate limiter configured"
        );

        Self {
            buckets: Arc::new(DashMap::new()),
            quota,
            stale_after,
        }
    }

    /// Check whether a request from this identity is allowed.
    ///
    /// Returns `true` and counts the request when under the cap, `false`
    /// when the identity must receive a 429.
    pub fn check(&self, identity: IpAddr) -> bool {
        let mut bucket = self.buckets.entry(identity).or_insert_with(|| Bucket {
            limiter: GovernorLimiter::direct(self.quota),
            last_seen: Instant::now(),
        });
        bucket.last_seen = Instant::now();
        bucket.limiter.check().is_ok()
    }

    /// Remove buckets idle for longer than the stale threshold.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_stale(&self) -> usize {
        let cutoff = Instant::now() - self.stale_after;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.last_seen > cutoff);
        let removed = before - self.buckets.len();
        if removed > 0 {
            debug!(
                removed,
                remaining = self.buckets.len(),
                "Reclaimed stale rate-limit buckets"
            );
        }
        removed
    }

    /// Number of identities currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }

    /// Spawn a background task that reclaims stale buckets until the
    /// cancellation token fires.
    pub fn spawn_cleanup_task(self: &Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let limiter = Arc::clone(self);
        let interval = limiter.stale_after / 2;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval.max(Duration::from_secs(1)));
            tick.tick().await; // Skip immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        limiter.cleanup_stale();
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Rate limiter cleanup task shutting down");
                        break;
                    }
                }
            }
        });
    }
}
