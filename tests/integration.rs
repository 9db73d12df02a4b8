//! End-to-end tests: a real proxy listener forwarding to a loopback mock
//! feed, with the resolver's loopback exception standing in for public
//! calendar hosts.

mod helpers;

use std::time::Duration;

use helpers::mock_feed::{self, BODY_LIMIT, ICS_BODY};
use helpers::{fetch_url, feed_target, loopback_config, spawn_proxy, test_client};
use reqwest::StatusCode;

#[tokio::test]
async fn test_allowed_target_is_relayed() {
    let feed = mock_feed::spawn().await;
    let proxy = spawn_proxy(loopback_config(), None).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, &feed_target(feed, "/basic.ics")))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/calendar"
    );
    assert!(resp.headers().contains_key("access-control-allow-origin"));
    assert_eq!(resp.text().await.unwrap(), ICS_BODY);
}

#[tokio::test]
async fn test_head_request_is_forwarded() {
    let feed = mock_feed::spawn().await;
    let proxy = spawn_proxy(loopback_config(), None).await;

    let resp = test_client()
        .head(fetch_url(proxy.addr, &feed_target(feed, "/basic.ics")))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.text().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_metadata_endpoint_is_blocked() {
    let proxy = spawn_proxy(loopback_config(), None).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, "http://169.254.169.254/latest/meta-data/"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "naughty, naughty...");
}

#[tokio::test]
async fn test_host_outside_allowlist_is_blocked() {
    let proxy = spawn_proxy(loopback_config(), None).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, "https://evil.com/foo.ics"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "calendar host not supported");
}

#[tokio::test]
async fn test_non_ics_extension_is_blocked() {
    let feed = mock_feed::spawn().await;
    let proxy = spawn_proxy(loopback_config(), None).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, &feed_target(feed, "/plain.txt")))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "only .ics files are supported");
}

#[tokio::test]
async fn test_allowed_hostname_resolving_to_loopback_is_rejected() {
    // Same allowlist, but no resolver exception: the hostname passes policy
    // and the resolved address is refused before any connect.
    let feed = mock_feed::spawn().await;
    let mut config = loopback_config();
    config.resolver_allow = Vec::new();
    let proxy = spawn_proxy(config, None).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, &feed_target(feed, "/basic.ics")))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "target address not allowed");
}

#[tokio::test]
async fn test_unresolvable_host_is_bad_gateway() {
    let mut config = loopback_config();
    config.allowed_host_suffixes = vec!["invalid".to_string()];
    let proxy = spawn_proxy(config, None).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, "https://calgate-missing-host.invalid/cal.ics"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_redirect_chain_within_budget_succeeds() {
    let feed = mock_feed::spawn().await;
    let proxy = spawn_proxy(loopback_config(), None).await;

    // Three hops against a budget of three.
    let resp = test_client()
        .get(fetch_url(proxy.addr, &feed_target(feed, "/chain/3.ics")))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), ICS_BODY);
}

#[tokio::test]
async fn test_redirect_chain_over_budget_is_blocked() {
    let feed = mock_feed::spawn().await;
    let proxy = spawn_proxy(loopback_config(), None).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, &feed_target(feed, "/chain/4.ics")))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "redirect blocked");
}

#[tokio::test]
async fn test_redirect_to_private_address_is_blocked() {
    let feed = mock_feed::spawn().await;
    let proxy = spawn_proxy(loopback_config(), None).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, &feed_target(feed, "/offsite.ics")))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "redirect blocked");
}

#[tokio::test]
async fn test_redirect_losing_extension_is_blocked() {
    let feed = mock_feed::spawn().await;
    let proxy = spawn_proxy(loopback_config(), None).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, &feed_target(feed, "/to-text.ics")))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "redirect blocked");
}

#[tokio::test]
async fn test_body_exactly_at_ceiling_completes() {
    let feed = mock_feed::spawn().await;
    let proxy = spawn_proxy(loopback_config(), None).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, &feed_target(feed, "/exact.ics")))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.bytes().await.unwrap().len() as u64, BODY_LIMIT);
}

#[tokio::test]
async fn test_declared_oversize_body_is_413() {
    let feed = mock_feed::spawn().await;
    let proxy = spawn_proxy(loopback_config(), None).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, &feed_target(feed, "/big.ics")))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(resp.text().await.unwrap().contains("cannot exceed"));
}

#[tokio::test]
async fn test_undeclared_oversize_body_is_truncated() {
    // Chunked response with no declared length: headers are already out
    // when the ceiling trips, so the transfer is cut instead of a 413.
    let feed = mock_feed::spawn().await;
    let proxy = spawn_proxy(loopback_config(), None).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, &feed_target(feed, "/drip.ics")))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    match resp.bytes().await {
        Ok(bytes) => assert!((bytes.len() as u64) <= BODY_LIMIT),
        Err(_) => {} // connection torn down mid-body
    }
}

#[tokio::test]
async fn test_slow_upstream_hits_deadline() {
    let feed = mock_feed::spawn().await;
    let mut config = loopback_config();
    config.request_timeout = Duration::from_millis(500);
    let proxy = spawn_proxy(config, None).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, &feed_target(feed, "/slow.ics")))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_rate_limit_rejects_only_the_excess() {
    let mut config = loopback_config();
    config.rate_limit = 2;
    config.rate_window = Duration::from_secs(60);
    let proxy = spawn_proxy(config, None).await;

    let client = test_client();
    let url = fetch_url(proxy.addr, "https://evil.com/foo.ics");

    for _ in 0..2 {
        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.text().await.unwrap(), "enhance your calm");
}

#[tokio::test]
async fn test_forwarded_header_hygiene() {
    let feed = mock_feed::spawn().await;
    let proxy = spawn_proxy(loopback_config(), Some("198.51.100.2".parse().unwrap())).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, &feed_target(feed, "/echo-headers.ics")))
        .header("cookie", "session=abc")
        .header("authorization", "Bearer tok")
        .header("origin", "https://app.example.org")
        .header("referer", "https://app.example.org/cal")
        .header("x-forwarded-for", "203.0.113.7")
        .header("user-agent", "calgate-test/1.0")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.text().await.unwrap();
    let seen: serde_json::Value = serde_json::from_str(&body).unwrap();

    assert!(seen.get("cookie").is_none());
    assert!(seen.get("authorization").is_none());
    assert!(seen.get("origin").is_none());
    assert!(seen.get("referer").is_none());
    assert_eq!(seen["host"], format!("localhost:{}", feed.port()));
    assert_eq!(seen["x-forwarded-for"], "203.0.113.7, 198.51.100.2");
    assert_eq!(seen["user-agent"], "calgate-test/1.0");
}

#[tokio::test]
async fn test_content_type_gate_when_configured() {
    let feed = mock_feed::spawn().await;
    let mut config = loopback_config();
    config.allowed_content_type = Some("text/calendar".to_string());
    let proxy = spawn_proxy(config, None).await;

    let resp = test_client()
        .get(fetch_url(proxy.addr, &feed_target(feed, "/wrong-type.ics")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await.unwrap(), "content type not allowed");

    let resp = test_client()
        .get(fetch_url(proxy.addr, &feed_target(feed, "/basic.ics")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_repeated_allowed_requests_below_cap_all_succeed() {
    let feed = mock_feed::spawn().await;
    let proxy = spawn_proxy(loopback_config(), None).await;
    let client = test_client();
    let url = fetch_url(proxy.addr, &feed_target(feed, "/basic.ics"));

    for _ in 0..5 {
        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.text().await.unwrap(), ICS_BODY);
    }
}
