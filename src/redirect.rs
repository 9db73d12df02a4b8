//! Redirect hop re-validation.
//!
//! The upstream client never follows a redirect on its own: each 3xx is
//! surfaced to the fetch loop, which asks [`RedirectGuard`] for the next
//! target. The guard re-runs the full fetch policy against the hop and
//! enforces the chain-length cap, so a compliant first target cannot bounce
//! the proxy onto a forbidden one. Address-level validation still happens
//! separately when the hop is connected.

use std::sync::Arc;

use http::HeaderMap;
use http::header::LOCATION;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::policy::{Deny, PolicyEvaluator};

/// Why a redirect hop was refused. The client always sees a flat
/// `400 redirect blocked`; the variants exist for the logs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RedirectBlocked {
    /// The chain exceeded the configured hop budget.
    #[error("redirect chain exceeded {limit} hops")]
    TooManyHops { limit: usize },

    /// Missing, unreadable, or unjoinable Location header.
    #[error("missing or malformed Location header")]
    BadLocation,

    /// The next hop failed a policy check.
    #[error("next hop rejected: {0}")]
    Policy(Deny),
}

/// Re-validates every redirect hop before it is followed.
#[derive(Debug, Clone)]
pub struct RedirectGuard {
    policy: Arc<PolicyEvaluator>,
    max_redirects: usize,
}

impl RedirectGuard {
    pub fn new(policy: Arc<PolicyEvaluator>, max_redirects: usize) -> Self {
        Self {
            policy,
            max_redirects,
        }
    }

    /// Compute and validate the next target for a redirect response.
    ///
    /// `hops_taken` counts redirects already followed for this fetch.
    /// A relative Location is resolved against the current target; the
    /// result must pass the same policy as the original request.
    ///
    /// # Errors
    ///
    /// [`RedirectBlocked`] when the hop budget is exhausted, the Location
    /// header is unusable, or the next target fails policy. The caller
    /// aborts the exchange before relaying any of the redirect body.
    pub fn next_hop(
        &self,
        current: &Url,
        headers: &HeaderMap,
        hops_taken: usize,
    ) -> Result<Url, RedirectBlocked> {
        if hops_taken >= self.max_redirects {
            warn!(
                limit = self.max_redirects,
                current = %current,
                "Redirect chain exceeded hop budget"
            );
            return Err(RedirectBlocked::TooManyHops {
                limit: self.max_redirects,
            });
        }

        let location = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(RedirectBlocked::BadLocation)?;

        let next = current
            .join(location)
            .map_err(|_| RedirectBlocked::BadLocation)?;

        if let Err(deny) = self.policy.check(&next) {
            warn!(current = %current, next = %next, deny = %deny, "Redirect hop failed policy");
            return Err(RedirectBlocked::Policy(deny));
        }

        debug!(current = %current, next = %next, hop = hops_taken + 1, "Following redirect");
        Ok(next)
    }
}
