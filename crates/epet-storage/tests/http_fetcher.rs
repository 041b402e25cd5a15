use std::time::Duration;

use epet_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher(timeout: Duration, max_retries: Option<usize>) -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout,
        user_agent: Some("epet-test".to_string()),
        backoff: BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        rate_limit: None,
    })
    .expect("fetcher")
}

#[derive(Debug, Deserialize)]
struct Envelope {
    last: bool,
}

#[tokio::test]
async fn passes_query_and_decodes_json() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/petitions/short"))
        .and(query_param("size", "10"))
        .and(query_param("page", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": [], "last": true})))
        .expect(1)
        .mount(&server)
        .await;

    let http = fetcher(Duration::from_secs(2), Some(0));
    let body: Envelope = http
        .fetch_json(
            &format!("{}/petitions/short", server.uri()),
            &[("size", "10".to_string()), ("page", "3".to_string())],
        )
        .await
        .expect("fetch");
    assert!(body.last);
}

#[tokio::test]
async fn server_errors_surface_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let http = fetcher(Duration::from_secs(2), None);
    let err = http
        .fetch_bytes(&format!("{}/petitions/x/signers", server.uri()), &[])
        .await
        .expect_err("500 must surface");
    assert_eq!(err.status(), Some(500));
}

#[tokio::test]
async fn timeouts_are_retried_per_policy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let http = fetcher(Duration::from_millis(50), Some(2));
    let err = http
        .fetch_bytes(&format!("{}/slow", server.uri()), &[])
        .await
        .expect_err("every attempt times out");
    match err {
        FetchError::Request(inner) => assert!(inner.is_timeout()),
        other => panic!("unexpected error {other:?}"),
    }
    let received = server.received_requests().await.expect("recording enabled");
    assert_eq!(received.len(), 3);
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let http = fetcher(Duration::from_secs(2), Some(0));
    let err = http
        .fetch_json::<Envelope>(&format!("{}/petitions/short", server.uri()), &[])
        .await
        .expect_err("not json");
    assert!(matches!(err, FetchError::Decode { .. }));
}
