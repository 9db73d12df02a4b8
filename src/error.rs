//! Error types for the proxy pipeline.
//!
//! Every failure mode maps to exactly one response status and a plain-text,
//! single-line body. Nothing internal (stack traces, upstream error chains)
//! leaks to the client; the full detail goes to the logs instead.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use thiserror::Error;

use crate::body_limit::BodyLimitExceeded;
use crate::policy::Deny;
use crate::redirect::RedirectBlocked;
use crate::resolver::ResolveError;
use crate::timeout::DeadlineExceeded;

/// Errors that can occur while handling a proxied fetch.
///
/// All variants are terminal for the request they occur in; nothing is
/// retried. Policy and size violations cannot succeed on retry, and retrying
/// transient network errors would amplify load onto a possibly-malicious
/// target.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Client identity exceeded its request quota (maps to 429).
    #[error("rate limited")]
    RateLimited,

    /// The inbound path did not name a fetch target (maps to 404).
    #[error("invalid fetch target: {0}")]
    InvalidTarget(String),

    /// Method other than GET/HEAD on the fetch route (maps to 405).
    #[error("method not allowed")]
    MethodNotAllowed,

    /// The target URL failed a policy check (maps to 400, or 404 for
    /// malformed / relative targets).
    #[error("target rejected: {0}")]
    Policy(#[from] Deny),

    /// Hostname resolution failed or resolved into a forbidden range.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// A redirect hop failed re-validation (maps to 400).
    #[error(transparent)]
    Redirect(#[from] RedirectBlocked),

    /// Upstream response content type does not match the configured pattern.
    #[error("response content type not allowed")]
    ContentType,

    /// A request or response body crossed the configured ceiling (maps to 413).
    #[error("body exceeds the configured maximum of {0} bytes")]
    TooLarge(u64),

    /// The outbound exchange missed its wall-clock deadline (maps to 504).
    #[error("upstream deadline exceeded")]
    Timeout,

    /// Transport-level upstream failure: reset, refused, protocol error
    /// (maps to 500).
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Anything unexpected (maps to 500).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// The response status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::InvalidTarget(_) => StatusCode::NOT_FOUND,
            ProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::Policy(deny) => deny.status(),
            ProxyError::Resolve(ResolveError::AddressRejected { .. }) => StatusCode::BAD_REQUEST,
            ProxyError::Resolve(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Redirect(_) => StatusCode::BAD_REQUEST,
            ProxyError::ContentType => StatusCode::BAD_REQUEST,
            ProxyError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(_) | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert the error into the client-facing response.
    ///
    /// Bodies are single plain-text lines; the interesting detail stays in
    /// the logs.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let body: String = match self {
            ProxyError::RateLimited => "enhance your calm".into(),
            ProxyError::InvalidTarget(_) => "url must be in the form of /fetch/{remote_url}".into(),
            ProxyError::MethodNotAllowed => "method not allowed".into(),
            ProxyError::Policy(deny) => deny.reason().into(),
            ProxyError::Resolve(ResolveError::AddressRejected { .. }) => {
                "target address not allowed".into()
            }
            ProxyError::Resolve(ResolveError::ResolutionFailed { host, .. })
            | ProxyError::Resolve(ResolveError::NoAddresses { host }) => {
                format!("host for {host} cannot be found")
            }
            ProxyError::Redirect(_) => "redirect blocked".into(),
            ProxyError::ContentType => "content type not allowed".into(),
            ProxyError::TooLarge(limit) => {
                format!("the content in the request or response cannot exceed {limit} bytes")
            }
            ProxyError::Timeout => "upstream request timed out".into(),
            ProxyError::Upstream(_) => "stream error".into(),
            ProxyError::Internal(_) => "internal error".into(),
        };

        Response::builder()
            .status(self.status())
            .header("Content-Type", "text/plain")
            .body(Full::new(Bytes::from(body)))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(Full::new(Bytes::from("internal error")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }

    /// Map a streaming body error back onto the taxonomy.
    ///
    /// Body wrappers surface boxed errors; the size and deadline wrappers
    /// use concrete types we can recover here.
    pub fn from_body_error(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        let err = match err.downcast::<BodyLimitExceeded>() {
            Ok(exceeded) => return ProxyError::TooLarge(exceeded.limit),
            Err(err) => err,
        };
        if err.is::<DeadlineExceeded>() {
            return ProxyError::Timeout;
        }
        ProxyError::Upstream(err.to_string())
    }
}
