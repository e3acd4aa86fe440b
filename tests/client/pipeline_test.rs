//! End-to-end pipeline tests against a local one-shot HTTP server.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use straylight::cache::ResponseCache;
use straylight::client::{HttpClient, RequestError, RetryPolicy};
use straylight::guardian::Guardian;
use straylight::policy::{Operation, Policy};
use straylight::ratelimit::{RateLimiter, RateLimiterConfig};

/// Spawn a local HTTP server that answers every connection with the given
/// status line and body, counting connections as it goes.
async fn serve_counting(
    status_line: &'static str,
    content_type: &'static str,
    body: &'static str,
    counter: Arc<AtomicUsize>,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener should expose local addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);

            let mut read_buf = [0_u8; 2048];
            let _ = socket.read(&mut read_buf).await;

            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });

    format!("http://{addr}/data")
}

/// A policy that admits loopback targets, for talking to the test server.
fn local_policy(allowed: &[Operation], confirm: &[Operation]) -> Policy {
    let mut policy = Policy::permissive();
    policy.name = "test-local".to_owned();
    policy.allowed_operations = allowed.iter().copied().collect::<HashSet<_>>();
    policy.require_confirmation = confirm.iter().copied().collect::<HashSet<_>>();
    policy
}

fn client(policy: Policy, limiter: RateLimiterConfig) -> HttpClient {
    HttpClient::with_parts(
        Guardian::new(policy),
        ResponseCache::new(32, 256 * 1024, Duration::from_secs(300)),
        RateLimiter::new(limiter),
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
        Duration::from_secs(2),
    )
}

#[tokio::test]
async fn get_returns_parsed_json() {
    let counter = Arc::new(AtomicUsize::new(0));
    let url = serve_counting(
        "200 OK",
        "application/json",
        r#"{"ok":true,"n":3}"#,
        Arc::clone(&counter),
    )
    .await;

    let client = client(
        local_policy(&[Operation::Get], &[]),
        RateLimiterConfig::default(),
    );
    let response = client.get(&url).await.expect("request should succeed");

    assert_eq!(response.status, 200);
    assert!(response.is_success());
    assert!(!response.from_cache);
    assert_eq!(
        response.body.as_json(),
        Some(&serde_json::json!({"ok": true, "n": 3}))
    );
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn text_content_type_parses_as_text() {
    let counter = Arc::new(AtomicUsize::new(0));
    let url = serve_counting("200 OK", "text/plain", "hello there", Arc::clone(&counter)).await;

    let client = client(
        local_policy(&[Operation::Get], &[]),
        RateLimiterConfig::default(),
    );
    let response = client.get(&url).await.expect("request should succeed");
    assert_eq!(response.body.as_text(), Some("hello there"));
}

#[tokio::test]
async fn http_500_is_surfaced_without_retry() {
    let counter = Arc::new(AtomicUsize::new(0));
    let url = serve_counting(
        "500 Internal Server Error",
        "text/plain",
        "upstream exploded",
        Arc::clone(&counter),
    )
    .await;

    let client = client(
        local_policy(&[Operation::Get], &[]),
        RateLimiterConfig::default(),
    );
    let err = client.get(&url).await;

    match err {
        Err(RequestError::HttpStatus { status, body, .. }) => {
            assert_eq!(status, 500);
            assert!(body.contains("upstream exploded"));
        }
        other => panic!("expected HttpStatus, got: {other:?}"),
    }

    // A delivered status is never retried: exactly one connection.
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn http_404_carries_the_final_url() {
    let counter = Arc::new(AtomicUsize::new(0));
    let url = serve_counting(
        "404 Not Found",
        "text/plain",
        "no such thing",
        Arc::clone(&counter),
    )
    .await;

    let client = client(
        local_policy(&[Operation::Get], &[]),
        RateLimiterConfig::default(),
    );
    let err = client.get(&url).await;

    match err {
        Err(RequestError::HttpStatus { status, url: final_url, .. }) => {
            assert_eq!(status, 404);
            assert!(final_url.contains("/data"));
        }
        other => panic!("expected HttpStatus, got: {other:?}"),
    }
}

#[tokio::test]
async fn confirmation_gate_blocks_then_approval_unblocks() {
    let counter = Arc::new(AtomicUsize::new(0));
    let url = serve_counting(
        "200 OK",
        "application/json",
        r#"{"created":true}"#,
        Arc::clone(&counter),
    )
    .await;
    let port = url::Url::parse(&url)
        .expect("test url")
        .port_or_known_default();

    let client = client(
        local_policy(&[Operation::Get, Operation::Post], &[Operation::Post]),
        RateLimiterConfig::default(),
    );

    // No approval on file: the POST is rejected before any network I/O.
    let err = client.post(&url, serde_json::json!({"name": "x"})).await;
    assert!(matches!(err, Err(RequestError::PolicyRejected { .. })));
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    // An out-of-band approval for the exact triple unblocks it.
    client
        .approve(Operation::Post, "127.0.0.1", port)
        .expect("approve");
    let response = client
        .post(&url, serde_json::json!({"name": "x"}))
        .await
        .expect("approved POST should run");
    assert_eq!(response.status, 200);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn head_requests_always_hit_the_network() {
    let counter = Arc::new(AtomicUsize::new(0));
    let url = serve_counting("200 OK", "text/plain", "", Arc::clone(&counter)).await;

    let client = client(
        local_policy(&[Operation::Head], &[]),
        RateLimiterConfig::default(),
    );
    client.head(&url).await.expect("first HEAD");
    client.head(&url).await.expect("second HEAD");

    // Only GETs are cacheable.
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}
