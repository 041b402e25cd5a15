use std::time::Duration;

use chrono::{FixedOffset, TimeZone, Utc};
use epet_adapters::{collect_parent, EpetitionApi, ListApi, ParentEnumerator, WalkSettings};
use epet_core::{HarvestWindow, RecordKind};
use epet_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn api(server: &MockServer) -> EpetitionApi {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(2),
        user_agent: Some("epet-test".to_string()),
        backoff: BackoffPolicy {
            max_retries: Some(0),
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
        },
        rate_limit: None,
    })
    .expect("fetcher");
    let offset = FixedOffset::east_opt(0).expect("utc offset");
    EpetitionApi::new(http, format!("{}/petitions/", server.uri()), offset)
}

#[tokio::test]
async fn parent_pages_are_enumerated_until_last() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/petitions/short"))
        .and(query_param("page", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"id": "a1", "title": "Parks"}, {"id": 42}],
            "last": false,
            "totalElements": 3
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/petitions/short"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"id": "c3"}],
            "last": true,
            "totalElements": 3
        })))
        .mount(&server)
        .await;

    let api = api(&server);
    let mut parents = ParentEnumerator::new(&api, 2);
    let mut ids = Vec::new();
    while let Some(batch) = parents.next_batch().await.expect("page") {
        ids.extend(batch.into_iter().map(|p| p.id));
    }
    assert_eq!(ids, vec!["a1", "42", "c3"]);
    assert_eq!(parents.total_elements(), Some(3));
}

#[tokio::test]
async fn child_pages_decode_records_and_naive_timestamps() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/petitions/p1/comments"))
        .and(query_param("size", "1000"))
        .and(query_param("page", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [
                {"id": "c2", "createdDate": "2024-03-01T10:00:00", "text": "second", "parentId": "c1"},
                {"id": "c1", "createdDate": "2024-03-01T09:00:00.250Z", "text": "first", "parentId": ""}
            ],
            "last": true
        })))
        .mount(&server)
        .await;

    let page = api(&server)
        .child_page(RecordKind::Comments, "p1", 1000, 0)
        .await
        .expect("page");
    assert!(page.is_last);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].id, "c2");
    assert_eq!(page.items[0].parent_id, "p1");
    assert_eq!(
        page.items[0].created_at,
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).single().unwrap()
    );
    assert_eq!(page.items[0].payload["parentId"], json!("c1"));
    assert_eq!(page.items[1].payload["text"], json!("first"));
}

#[tokio::test]
async fn faulted_page_is_recovered_over_http() {
    let server = MockServer::start().await;
    let signer = |minute: u32| {
        json!({"fio": format!("signer {minute}"), "createdDate": format!("2024-05-01T12:{minute:02}:00Z")})
    };
    Mock::given(method("GET"))
        .and(path("/petitions/p9/signers"))
        .and(query_param("size", "2"))
        .and(query_param("page", "0"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/petitions/p9/signers"))
        .and(query_param("size", "1"))
        .and(query_param("page", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": [signer(30)], "last": false})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/petitions/p9/signers"))
        .and(query_param("size", "1"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/petitions/p9/signers"))
        .and(query_param("size", "2"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": [signer(10)], "last": true})))
        .mount(&server)
        .await;

    let window = HarvestWindow::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap(),
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single().unwrap(),
    );
    let harvest = collect_parent(&api(&server), RecordKind::Signers, "p9", window, WalkSettings::new(2))
        .await
        .expect("collect");

    let names: Vec<_> = harvest
        .records
        .iter()
        .map(|r| r.payload["fio"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(names, vec!["signer 30", "signer 10"]);
    assert_eq!(harvest.skipped, vec![1]);
    assert!(harvest.records.iter().all(|r| !r.id.is_empty()));
}

#[tokio::test]
async fn missing_timestamp_is_a_decode_fault() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/petitions/p1/comments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"id": "c1", "text": "no date"}],
            "last": true
        })))
        .mount(&server)
        .await;

    let err = api(&server)
        .child_page(RecordKind::Comments, "p1", 10, 0)
        .await
        .expect_err("record without timestamp");
    assert!(matches!(err, FetchError::Decode { .. }));
}

#[tokio::test]
async fn not_found_parent_propagates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = api(&server)
        .petition_detail("gone")
        .await
        .expect_err("404");
    assert_eq!(err.status(), Some(404));
}
