//! Target URL policy evaluation.
//!
//! Pure functions deciding whether a requested URL may be fetched: scheme,
//! private-network prefilter, file extension, and the calendar-provider
//! allowlist. No I/O happens here; address-level enforcement is the
//! resolver's job and runs independently of these checks.

use hyper::StatusCode;
use thiserror::Error;
use url::{Host, Url};

use crate::config::ProxyConfig;
use crate::resolver::is_disallowed_ip;

/// Closed set of reasons a target can be denied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Deny {
    /// The string could not be decoded or parsed as a URL.
    #[error("malformed url")]
    Malformed,

    /// The URL has no hostname (relative reference).
    #[error("relative url")]
    NoHost,

    /// Scheme other than http/https, or http while HTTPS-only is enforced.
    #[error("scheme not allowed")]
    Scheme,

    /// Hostname matches the private/internal-network prefilter.
    #[error("blocked host")]
    BlockedHost,

    /// Path does not end in ".ics".
    #[error("extension not allowed")]
    Extension,

    /// Hostname does not match the provider allowlist.
    #[error("host not allowed")]
    HostNotAllowed,
}

impl Deny {
    /// Status code for the client response. Shape problems are 404 like any
    /// other unroutable request; policy refusals are 400.
    pub fn status(&self) -> StatusCode {
        match self {
            Deny::Malformed | Deny::NoHost => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Literal single-line body sent to the client.
    pub fn reason(&self) -> &'static str {
        match self {
            Deny::Malformed => "url must be in the form of /fetch/{remote_url}",
            Deny::NoHost => "relative urls are not supported",
            Deny::Scheme => "only http and https are supported",
            Deny::BlockedHost => "naughty, naughty...",
            Deny::Extension => "only .ics files are supported",
            Deny::HostNotAllowed => "calendar host not supported",
        }
    }
}

/// Evaluates raw target strings against the static fetch policy.
///
/// Construct once from configuration and share; evaluation is a pure
/// function of the input.
#[derive(Debug, Clone)]
pub struct PolicyEvaluator {
    allowed_suffixes: Vec<String>,
    blocked_labels: Vec<String>,
    https_only: bool,
}

impl PolicyEvaluator {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            allowed_suffixes: config
                .allowed_host_suffixes
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            blocked_labels: config
                .blocked_host_labels
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            https_only: config.https_only,
        }
    }

    /// Decode and parse a raw target string, then run every policy check.
    ///
    /// Returns the validated URL on success. Each redirect hop goes through
    /// [`PolicyEvaluator::check`] with a freshly derived URL; targets are
    /// never mutated in place.
    pub fn evaluate(&self, raw: &str) -> Result<Url, Deny> {
        let decoded = urlencoding::decode(raw).map_err(|_| Deny::Malformed)?;
        let url = Url::parse(&decoded).map_err(|_| Deny::Malformed)?;
        self.check(&url)?;
        Ok(url)
    }

    /// Run the full policy against an already-parsed URL.
    pub fn check(&self, url: &Url) -> Result<(), Deny> {
        let host = match url.host() {
            Some(host) => host,
            None => return Err(Deny::NoHost),
        };

        match url.scheme() {
            "https" => {}
            "http" if !self.https_only => {}
            _ => return Err(Deny::Scheme),
        }

        // Cheap prefilter; the resolver re-checks actual addresses later.
        // The blocklist wins over the allowlist.
        if self.host_is_blocked(&host) {
            return Err(Deny::BlockedHost);
        }

        if !url.path().to_ascii_lowercase().ends_with(".ics") {
            return Err(Deny::Extension);
        }

        let host_lower = match host {
            Host::Domain(domain) => domain.to_ascii_lowercase(),
            other => other.to_string(),
        };
        if !host_allowed(&host_lower, &self.allowed_suffixes) {
            return Err(Deny::HostNotAllowed);
        }

        Ok(())
    }

    fn host_is_blocked(&self, host: &Host<&str>) -> bool {
        match host {
            Host::Ipv4(addr) => is_disallowed_ip((*addr).into()),
            Host::Ipv6(addr) => is_disallowed_ip((*addr).into()),
            Host::Domain(domain) => {
                let domain = domain.to_ascii_lowercase();
                has_private_numeric_prefix(&domain)
                    || domain
                        .split('.')
                        .any(|label| self.blocked_labels.iter().any(|blocked| label == blocked))
            }
        }
    }
}

/// True when the hostname starts with a dotted-numeric prefix belonging to a
/// private, loopback, link-local, shared-address-space, or all-zeros range.
///
/// Explicit range checks rather than string patterns, so "172.20.evil.com"
/// is caught while "172.99.evil.com" is not.
pub fn has_private_numeric_prefix(host: &str) -> bool {
    let mut labels = host.split('.');
    let first = labels.next().and_then(|l| l.parse::<u16>().ok());
    let second = labels.next().and_then(|l| l.parse::<u16>().ok());

    match (first, second) {
        (Some(10), _) | (Some(127), _) | (Some(0), _) => true,
        (Some(172), Some(b)) => (16..=31).contains(&b),
        (Some(192), Some(168)) => true,
        (Some(169), Some(254)) => true,
        (Some(100), Some(b)) => (64..=127).contains(&b),
        _ => false,
    }
}

/// Suffix-anchored allowlist match.
///
/// The suffix must cover whole labels from the end of the hostname:
/// "sub.calendar.google.com" matches "calendar.google.com", while
/// "evilcalendar.google.com" and "calendar.google.com.attacker.net" do not.
pub fn host_allowed(host: &str, suffixes: &[String]) -> bool {
    suffixes
        .iter()
        .any(|suffix| host == suffix || host.ends_with(&format!(".{suffix}")))
}
