//! Core proxy service implementation.
//!
//! # Overview
//!
//! `ProxyService` is the entry point for all inbound traffic. One request
//! moves through a fixed pipeline:
//!
//! ```text
//! rate limit -> parse /fetch target -> policy -> resolve (SSRF check)
//!            -> forward -> re-validate each redirect hop -> relay body
//! ```
//!
//! Every stage can terminate the request with a specific status; once the
//! upstream response starts streaming, the size ceiling and the exchange
//! deadline ride along inside the body.
//!
//! The upstream client never follows redirects itself and resolves
//! hostnames through [`SafeResolver`], so the addresses actually connected
//! to are exactly the validated ones.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http_body::Body as _;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use tower::Service;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::body_limit::{BodyLimitExceeded, LimitedBody};
use crate::config::ProxyConfig;
use crate::cors;
use crate::error::{ProxyError, ProxyResult};
use crate::policy::PolicyEvaluator;
use crate::rate_limiter::{ClientRateLimiter, client_identity};
use crate::redirect::RedirectGuard;
use crate::resolver::{ResolveError, SafeResolver};
use crate::timeout::{DeadlineBody, DeadlineExceeded};

/// Body type sent to the upstream.
type ClientBody = BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Unified response body type: literal error bodies and streamed upstream
/// bodies, boxed for one return type.
pub type UnifiedBody = BoxBody<Bytes, ProxyError>;

/// Transport peer address, injected into request extensions by the
/// connection handler.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Request headers never forwarded upstream: credential and context leakage
/// to third-party hosts.
const STRIPPED_HEADERS: &[&str] = &["origin", "referer", "cookie", "authorization", "host"];

/// The main proxy service.
#[derive(Clone)]
pub struct ProxyService {
    /// HTTPS-capable upstream client; resolves through [`SafeResolver`].
    client: Client<HttpsConnector<HttpConnector<SafeResolver>>, ClientBody>,
    config: Arc<ProxyConfig>,
    policy: Arc<PolicyEvaluator>,
    resolver: SafeResolver,
    guard: RedirectGuard,
    limiter: Arc<ClientRateLimiter>,
    /// Appended to forwarded-for chains when known.
    public_ip: Option<IpAddr>,
}

impl ProxyService {
    /// Create the service: TLS client, policy evaluator, redirect guard.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Internal` if the TLS crypto provider cannot be
    /// installed or the native root store cannot be loaded.
    pub fn new(
        config: Arc<ProxyConfig>,
        limiter: Arc<ClientRateLimiter>,
        public_ip: Option<IpAddr>,
    ) -> ProxyResult<Self> {
        // Install the default crypto provider exactly once; capture the
        // result instead of panicking on the second call.
        static RUSTLS_INIT: std::sync::OnceLock<Result<(), ()>> = std::sync::OnceLock::new();
        let init_result = RUSTLS_INIT.get_or_init(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| ())
        });
        if init_result.is_err() {
            return Err(ProxyError::Internal(
                "failed to install rustls crypto provider".into(),
            ));
        }

        let resolver = SafeResolver::new(config.resolver_allow.clone());

        let mut http_connector = HttpConnector::new_with_resolver(resolver.clone());
        http_connector.enforce_http(false);
        http_connector.set_nodelay(config.tcp_nodelay);

        let https_connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| ProxyError::Internal(format!("failed to load native TLS roots: {e}")))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(https_connector);

        let policy = Arc::new(PolicyEvaluator::from_config(&config));
        let guard = RedirectGuard::new(policy.clone(), config.max_redirects);

        Ok(Self {
            client,
            config,
            policy,
            resolver,
            guard,
            limiter,
            public_ip,
        })
    }

    /// Handle one inbound request, always producing a response.
    ///
    /// Errors are mapped to their status and literal body here so that the
    /// CORS headers land on every response, including failures.
    pub async fn respond(&self, req: Request<Incoming>) -> Response<UnifiedBody> {
        let request_headers = req.headers().clone();
        let is_preflight = req.method() == Method::OPTIONS;

        let mut response = match self.handle(req).await {
            Ok(response) => response,
            Err(e) => {
                let status = e.status();
                if status.is_server_error() {
                    error!(error = %e, status = %status, "Request failed");
                } else {
                    info!(error = %e, status = %status, "Request refused");
                }
                e.to_response().map(|body| body.map_err(|e| match e {}).boxed())
            }
        };

        cors::apply_cors(
            &request_headers,
            response.headers_mut(),
            &self.config.cors_origin,
        );
        if is_preflight {
            cors::apply_preflight(&request_headers, response.headers_mut());
        }

        response
    }

    /// Route dispatch and the per-request state machine.
    async fn handle(&self, req: Request<Incoming>) -> ProxyResult<Response<UnifiedBody>> {
        // Preflights are answered before any other processing.
        if req.method() == Method::OPTIONS {
            return Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(empty_unified_body())
                .map_err(|e| ProxyError::Internal(e.to_string()));
        }

        let path = req.uri().path();

        // Health checks skip the rate limiter so orchestrators cannot be
        // starved out by noisy clients.
        if path == "/health" || path == "/up" {
            return Response::builder()
                .status(StatusCode::OK)
                .body(empty_unified_body())
                .map_err(|e| ProxyError::Internal(e.to_string()));
        }

        let peer = req
            .extensions()
            .get::<ClientAddr>()
            .map(|a| a.0)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let identity = client_identity(req.headers(), peer);

        if !self.limiter.check(identity) {
            info!(client = %identity, "Rate limited");
            return Err(ProxyError::RateLimited);
        }

        // Only safe read-only methods are proxied.
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return Err(ProxyError::MethodNotAllowed);
        }

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or(path)
            .to_string();

        match path_and_query.strip_prefix("/fetch/") {
            Some(raw) if !raw.is_empty() => self.fetch(raw, identity, req).await,
            _ => Err(ProxyError::InvalidTarget(path_and_query)),
        }
    }

    /// Forward one validated fetch, re-validating every redirect hop.
    async fn fetch(
        &self,
        raw: &str,
        client_ip: IpAddr,
        req: Request<Incoming>,
    ) -> ProxyResult<Response<UnifiedBody>> {
        let mut target = self.policy.evaluate(raw)?;
        debug!(target = %target, "Fetch target accepted by policy");

        // One wall-clock deadline covers connect through the final body byte.
        let deadline = tokio::time::Instant::now() + self.config.request_timeout;
        let limit = self.config.max_body_bytes;

        let (parts, inbound_body) = req.into_parts();
        let base_headers = prepare_upstream_headers(&parts.headers, client_ip, self.public_ip);

        // The inbound body rides along on the first hop only; redirect hops
        // re-issue the (GET/HEAD) request with an empty body.
        let mut outbound_body: Option<ClientBody> =
            Some(LimitedBody::new(inbound_body, limit).boxed());

        let mut hops = 0usize;
        let upstream_response = loop {
            let host = target
                .host_str()
                .ok_or_else(|| ProxyError::Internal("validated target lost its host".into()))?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            let port = target.port_or_known_default().unwrap_or(443);

            // Resolution is validated before any byte is sent upstream; the
            // connector resolves through the same filter at connect time, so
            // a rebind between here and the connect cannot slip through.
            let chosen = self.resolver.resolve(&host, port).await?;
            debug!(host = %host, addr = %chosen, "Resolved upstream");

            let uri: Uri = target
                .as_str()
                .parse()
                .map_err(|e| ProxyError::Internal(format!("unparseable target uri: {e}")))?;

            let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
            let headers = builder
                .headers_mut()
                .ok_or_else(|| ProxyError::Internal("request builder in invalid state".into()))?;
            *headers = base_headers.clone();
            headers.insert(header::HOST, host_header_value(&target)?);

            let body = outbound_body.take().unwrap_or_else(empty_client_body);
            let upstream_req = builder
                .body(body)
                .map_err(|e| ProxyError::Internal(format!("failed to build upstream request: {e}")))?;

            let response =
                match tokio::time::timeout_at(deadline, self.client.request(upstream_req)).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => return Err(map_client_error(e)),
                    Err(_) => return Err(ProxyError::Timeout),
                };

            if response.status().is_redirection()
                && response.headers().contains_key(header::LOCATION)
            {
                // Re-validate before any of the redirect body is relayed;
                // dropping the response closes its stream.
                target = self.guard.next_hop(&target, response.headers(), hops)?;
                hops += 1;
                continue;
            }

            break response;
        };

        if let Some(pattern) = &self.config.allowed_content_type {
            let pattern = pattern.to_ascii_lowercase();
            let matched = upstream_response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.to_ascii_lowercase().contains(&pattern))
                .unwrap_or(false);
            if !matched {
                warn!(target = %target, "Upstream content type outside the configured pattern");
                return Err(ProxyError::ContentType);
            }
        }

        // A declared length over the ceiling fails before any byte is
        // relayed; undeclared lengths are caught by the stream wrapper.
        if let Some(declared) = upstream_response.body().size_hint().exact() {
            if declared > limit {
                return Err(ProxyError::TooLarge(limit));
            }
        }

        let (mut response_parts, response_body) = upstream_response.into_parts();
        strip_hop_by_hop(&mut response_parts.headers);

        let limited = LimitedBody::new(DeadlineBody::new(response_body, deadline), limit);
        let body: UnifiedBody = limited.map_err(ProxyError::from_body_error).boxed();

        info!(target = %target, status = %response_parts.status, hops, "Relaying upstream response");
        Ok(Response::from_parts(response_parts, body))
    }
}

impl Service<Request<Incoming>> for ProxyService {
    type Response = Response<UnifiedBody>;
    type Error = std::convert::Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.respond(req).await) })
    }
}

/// Check if a header is hop-by-hop and must not be forwarded in either
/// direction. Framing is recomputed by hyper on each leg, so
/// transfer-encoding is stripped too; upgrades are not supported here.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn is_stripped_header(name: &str) -> bool {
    STRIPPED_HEADERS
        .iter()
        .any(|stripped| name.eq_ignore_ascii_case(stripped))
}

/// Build the outbound header set: hop-by-hop and credential headers
/// removed, everything else (User-Agent, Accept, ...) preserved verbatim,
/// and the forwarded-for chain extended with the proxy's public address
/// when it is known.
fn prepare_upstream_headers(
    inbound: &HeaderMap,
    client_ip: IpAddr,
    public_ip: Option<IpAddr>,
) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop_header(name.as_str()) || is_stripped_header(name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if let Some(public_ip) = public_ip {
        let chain = match inbound.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.trim().is_empty() => format!("{existing}, {public_ip}"),
            _ => format!("{client_ip}, {public_ip}"),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            out.insert(X_FORWARDED_FOR, value);
        }
    }

    out
}

/// Strip hop-by-hop headers from the upstream response before relaying.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}

/// Host header for the target, carrying an explicit port only when the URL
/// does.
fn host_header_value(url: &Url) -> ProxyResult<HeaderValue> {
    let host = url.host_str().unwrap_or_default();
    let value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    HeaderValue::from_str(&value)
        .map_err(|_| ProxyError::Internal("target host is not a valid header value".into()))
}

fn empty_client_body() -> ClientBody {
    Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
}

fn empty_unified_body() -> UnifiedBody {
    Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
}

/// Map upstream client errors onto the taxonomy.
///
/// Resolver rejections and body-wrapper failures surface through the
/// client's error chain and are recovered by downcasting; everything else
/// is classified by message, which is the best the boxed hyper errors
/// allow.
fn map_client_error(e: hyper_util::client::legacy::Error) -> ProxyError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&e);
    while let Some(err) = source {
        if let Some(resolve) = err.downcast_ref::<ResolveError>() {
            return ProxyError::Resolve(match resolve {
                ResolveError::AddressRejected { host, addr } => ResolveError::AddressRejected {
                    host: host.clone(),
                    addr: *addr,
                },
                ResolveError::ResolutionFailed { host, source } => {
                    ResolveError::ResolutionFailed {
                        host: host.clone(),
                        source: std::io::Error::other(source.to_string()),
                    }
                }
                ResolveError::NoAddresses { host } => ResolveError::NoAddresses {
                    host: host.clone(),
                },
            });
        }
        // A request body that crossed the ceiling aborts the send.
        if let Some(exceeded) = err.downcast_ref::<BodyLimitExceeded>() {
            return ProxyError::TooLarge(exceeded.limit);
        }
        if err.downcast_ref::<DeadlineExceeded>().is_some() {
            return ProxyError::Timeout;
        }
        source = err.source();
    }

    let message = e.to_string().to_lowercase();
    if message.contains("timeout") || message.contains("timed out") {
        warn!(error = %e, "Upstream timeout");
        return ProxyError::Timeout;
    }

    warn!(error = %e, "Upstream transport error");
    ProxyError::Upstream(e.to_string())
}
