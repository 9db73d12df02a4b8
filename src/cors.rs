//! CORS header injection.
//!
//! The proxy exists because the browser cannot make the cross-origin request
//! itself, so every response - success or error - carries CORS headers.
//! Preflights additionally echo the requested method and headers and are
//! answered with 204 before any other processing.

use http::header::{HeaderMap, HeaderName, HeaderValue, ORIGIN};

const ALLOW_ORIGIN: HeaderName = HeaderName::from_static("access-control-allow-origin");
const ALLOW_METHODS: HeaderName = HeaderName::from_static("access-control-allow-methods");
const ALLOW_HEADERS: HeaderName = HeaderName::from_static("access-control-allow-headers");
const REQUEST_METHOD: HeaderName = HeaderName::from_static("access-control-request-method");
const REQUEST_HEADERS: HeaderName = HeaderName::from_static("access-control-request-headers");

/// Add the allow-origin header to a response: the request's Origin when it
/// sent one, the configured origin otherwise.
pub fn apply_cors(request: &HeaderMap, response: &mut HeaderMap, configured_origin: &str) {
    let origin = request
        .get(ORIGIN)
        .cloned()
        .or_else(|| HeaderValue::from_str(configured_origin).ok())
        .unwrap_or(HeaderValue::from_static("*"));
    response.insert(ALLOW_ORIGIN, origin);
}

/// Echo the preflight's requested method and headers onto the response.
pub fn apply_preflight(request: &HeaderMap, response: &mut HeaderMap) {
    if let Some(method) = request.get(REQUEST_METHOD) {
        response.insert(ALLOW_METHODS, method.clone());
    }
    if let Some(headers) = request.get(REQUEST_HEADERS) {
        response.insert(ALLOW_HEADERS, headers.clone());
    }
}
