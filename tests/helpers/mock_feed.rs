//! Mock calendar host for integration testing.
//!
//! Serves a handful of fixed routes exercising the interesting upstream
//! behaviors: plain feeds, redirect chains, redirects that leave policy,
//! oversized and slow bodies, and a header echo for hygiene checks.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Path;
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tokio::net::TcpListener;

/// Body ceiling the loopback proxy config uses; feed routes are sized
/// against it.
pub const BODY_LIMIT: u64 = 64 * 1024;

/// A small but real calendar body.
pub const ICS_BODY: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:-//calgate//mock feed//EN\r\n\
BEGIN:VEVENT\r\n\
UID:mock-1\r\n\
DTSTART:20260804T100000Z\r\n\
SUMMARY:Standup\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

/// Start the mock feed on an ephemeral loopback port.
pub async fn spawn() -> SocketAddr {
    let router = Router::new()
        .route("/basic.ics", get(basic))
        .route("/chain/{hop}", get(chain))
        .route("/offsite.ics", get(offsite))
        .route("/to-text.ics", get(to_text))
        .route("/plain.txt", get(plain))
        .route("/wrong-type.ics", get(wrong_type))
        .route("/exact.ics", get(exact))
        .route("/big.ics", get(big))
        .route("/drip.ics", get(drip))
        .route("/slow.ics", get(slow))
        .route("/echo-headers.ics", get(echo_headers));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock feed");
    let addr = listener.local_addr().expect("mock feed has no local addr");

    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    addr
}

async fn basic() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/calendar")], ICS_BODY)
}

/// `/chain/{n}.ics` redirects down to `/chain/0.ics`, which serves the feed.
async fn chain(Path(hop): Path<String>) -> Response {
    let n: u32 = hop.trim_end_matches(".ics").parse().unwrap_or(0);
    if n == 0 {
        basic().await.into_response()
    } else {
        Redirect::temporary(&format!("/chain/{}.ics", n - 1)).into_response()
    }
}

async fn offsite() -> Redirect {
    Redirect::temporary("http://10.0.0.9/internal.ics")
}

async fn to_text() -> Redirect {
    Redirect::temporary("/plain.txt")
}

async fn plain() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], "not a calendar")
}

async fn wrong_type() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html")], "<html>nope</html>")
}

/// Exactly at the proxy's body ceiling.
async fn exact() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/calendar")],
        vec![b'A'; BODY_LIMIT as usize],
    )
}

/// One byte past the proxy's body ceiling, with a declared length.
async fn big() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/calendar")],
        vec![b'A'; BODY_LIMIT as usize + 1],
    )
}

/// Twice the ceiling, chunked, so no declared length gives it away.
async fn drip() -> Response {
    let chunks = (0..64).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![b'B'; 2048])));
    let stream = futures_util::stream::iter(chunks);
    (
        [(header::CONTENT_TYPE, "text/calendar")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn slow() -> impl IntoResponse {
    tokio::time::sleep(Duration::from_secs(30)).await;
    ([(header::CONTENT_TYPE, "text/calendar")], ICS_BODY)
}

/// Echo the received headers as JSON so hygiene can be asserted.
async fn echo_headers(headers: HeaderMap) -> impl IntoResponse {
    let seen: BTreeMap<String, String> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or("<binary>").to_string(),
            )
        })
        .collect();
    (
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_string(&seen).unwrap_or_default(),
    )
}
