//! Caching scenarios: cache hits must bypass the rate limiter entirely.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use straylight::cache::ResponseCache;
use straylight::client::{HttpClient, RequestOptions, RetryPolicy};
use straylight::guardian::Guardian;
use straylight::policy::{Operation, Policy};
use straylight::ratelimit::{RateLimiter, RateLimiterConfig};

async fn serve_json(body: &'static str, counter: Arc<AtomicUsize>) -> String {
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
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });

    format!("http://{addr}/report")
}

fn get_only_policy() -> Policy {
    let mut policy = Policy::permissive();
    policy.name = "get-only".to_owned();
    policy.allowed_operations = HashSet::from([Operation::Get]);
    policy
}

fn tight_client(limiter: RateLimiterConfig) -> HttpClient {
    HttpClient::with_parts(
        Guardian::new(get_only_policy()),
        ResponseCache::new(32, 256 * 1024, Duration::from_secs(300)),
        RateLimiter::new(limiter),
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
        Duration::from_secs(2),
    )
}

#[tokio::test]
async fn second_get_within_ttl_is_a_cache_hit_and_skips_the_limiter() {
    let counter = Arc::new(AtomicUsize::new(0));
    let url = serve_json(r#"{"value":42}"#, Arc::clone(&counter)).await;

    // Burst of one: a second network call would need a full second of
    // refill, so a fail-fast second GET proves the limiter was bypassed.
    let client = tight_client(RateLimiterConfig {
        requests_per_sec: 1.0,
        burst: 1,
        per_host: false,
    });

    let first = client.get(&url).await.expect("first GET hits the network");
    assert!(!first.from_cache);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let second = client
        .get_with(&url, RequestOptions::default().fail_fast())
        .await
        .expect("second GET must be served from cache");
    assert!(second.from_cache);
    assert_eq!(second.body, first.body, "cached content is identical");
    assert_eq!(counter.load(Ordering::SeqCst), 1, "no second connection");

    let stats = client.cache_stats().expect("stats");
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entry_count, 1);
}

#[tokio::test]
async fn opting_out_of_the_cache_refetches() {
    let counter = Arc::new(AtomicUsize::new(0));
    let url = serve_json(r#"{"value":1}"#, Arc::clone(&counter)).await;

    let client = tight_client(RateLimiterConfig::default());
    let options = RequestOptions::default().without_cache();

    client
        .get_with(&url, options.clone())
        .await
        .expect("first GET");
    client.get_with(&url, options).await.expect("second GET");

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    let stats = client.cache_stats().expect("stats");
    assert_eq!(stats.entry_count, 0, "uncached calls store nothing");
}

#[tokio::test]
async fn pattern_invalidation_forces_a_refetch() {
    let counter = Arc::new(AtomicUsize::new(0));
    let url = serve_json(r#"{"value":7}"#, Arc::clone(&counter)).await;

    let client = tight_client(RateLimiterConfig::default());

    client.get(&url).await.expect("first GET");
    let removed = client.invalidate_cache("/report").expect("invalidate");
    assert_eq!(removed, 1);

    client.get(&url).await.expect("refetch");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn varying_accept_header_fragments_the_cache() {
    let counter = Arc::new(AtomicUsize::new(0));
    let url = serve_json(r#"{"value":9}"#, Arc::clone(&counter)).await;

    let client = tight_client(RateLimiterConfig::default());

    client
        .get_with(
            &url,
            RequestOptions::default().with_header("accept", "application/json"),
        )
        .await
        .expect("json accept");
    client
        .get_with(
            &url,
            RequestOptions::default().with_header("accept", "text/plain"),
        )
        .await
        .expect("text accept");

    // Different accept values are different canonical keys.
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(client.cache_stats().expect("stats").entry_count, 2);
}
