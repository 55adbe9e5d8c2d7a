use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use pdpe_adapters::{CollectContext, HttpFeedCollector, SourceCollector, SourceKind};
use pdpe_core::CollectionError;
use pdpe_storage::{HttpClientConfig, HttpFetcher, RetryPolicy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

fn ctx() -> CollectContext {
    CollectContext::new(Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).single().unwrap())
}

fn response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Answers one connection per canned response, in order.
async fn serve(responses: Vec<String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for canned in responses {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(canned.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        }
    });
    format!("http://{addr}/feed.json")
}

fn collector(url: String) -> HttpFeedCollector {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: Some("pdpe-test/0.1".into()),
        retry: RetryPolicy {
            max_retries: 2,
            initial_wait: Duration::from_millis(10),
            wait_cap: Duration::from_millis(50),
        },
    })
    .unwrap();
    HttpFeedCollector::new("predicthq", SourceKind::Venues, url, Arc::new(fetcher))
}

fn places_feed() -> String {
    serde_json::json!({
        "venues": [
            {
                "external_id": "phq-1",
                "provider": "predicthq",
                "name": "Power & Light District",
                "lat": 39.0972,
                "lng": -94.5829,
                "timestamp": "2026-03-01T17:00:00Z"
            },
            {
                "external_id": "phq-2",
                "provider": "predicthq",
                "name": "Enterprise Center",
                "lat": 38.6268,
                "lng": -90.2027,
                "timestamp": "2026-03-01T17:00:00Z"
            }
        ]
    })
    .to_string()
}

#[tokio::test]
async fn feed_is_fetched_and_filtered_to_area() {
    let url = serve(vec![response("200 OK", &places_feed())]).await;
    let output = collector(url).collect(&ctx()).await.unwrap();
    assert_eq!(output.venues.len(), 1);
    assert_eq!(output.venues[0].name, "Power & Light District");
}

#[tokio::test]
async fn unavailable_upstream_is_retried() {
    let url = serve(vec![
        response("503 Service Unavailable", "{}"),
        response("200 OK", &places_feed()),
    ])
    .await;
    let output = collector(url).collect(&ctx()).await.unwrap();
    assert_eq!(output.venues.len(), 1);
}

#[tokio::test]
async fn missing_feed_is_a_network_failure() {
    let url = serve(vec![response("404 Not Found", "{}")]).await;
    let err = collector(url).collect(&ctx()).await.unwrap_err();
    assert!(matches!(&err, CollectionError::Network(msg) if msg.contains("404")), "{err:?}");
}

#[tokio::test]
async fn malformed_feed_is_a_validation_failure() {
    let url = serve(vec![response("200 OK", "<html>maintenance</html>")]).await;
    let err = collector(url).collect(&ctx()).await.unwrap_err();
    assert!(matches!(err, CollectionError::Validation(_)), "{err:?}");
}
