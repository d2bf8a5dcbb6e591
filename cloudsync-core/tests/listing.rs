use cloudsync_core::{ListingClient, ListingError, ResourceType};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn list_page_returns_embedded_items() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/listing"))
        .and(query_param("path", "/Docs"))
        .and(query_param("limit", "2"))
        .and(query_param("offset", "0"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_embedded": {
                "limit": 2,
                "offset": 0,
                "total": 2,
                "sync_anchor": 17,
                "items": [
                    { "path": "/Docs/A.txt", "type": "file", "size": 1, "etag": "e1", "file_id": "f1" },
                    { "path": "/Docs/B", "type": "dir" }
                ]
            }
        })))
        .mount(&server)
        .await;

    let client = ListingClient::with_base_url(&server.uri(), Some("test-token".into())).unwrap();
    let page = client.list_page("/Docs", 2, 0).await.unwrap();

    assert_eq!(page.items.len(), 2);
    assert_eq!(page.sync_anchor, Some(17));
    assert_eq!(page.items[0].etag.as_deref(), Some("e1"));
    assert_eq!(page.items[1].resource_type, ResourceType::Dir);
}

#[tokio::test]
async fn list_all_follows_offsets_and_keeps_first_anchor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/listing"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_embedded": {
                "limit": 1, "offset": 0, "total": 2, "sync_anchor": 5,
                "items": [{ "path": "/Docs/A.txt", "type": "file" }]
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/listing"))
        .and(query_param("offset", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_embedded": {
                "limit": 1, "offset": 1, "total": 2, "sync_anchor": 6,
                "items": [{ "path": "/Docs/B.txt", "type": "file" }]
            }
        })))
        .mount(&server)
        .await;

    let client = ListingClient::with_base_url(&server.uri(), None).unwrap();
    let listing = client.list_all("/Docs", 1).await.unwrap();

    assert_eq!(listing.items.len(), 2);
    assert_eq!(listing.sync_anchor, Some(5));
}

#[tokio::test]
async fn api_errors_carry_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/listing"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&server)
        .await;

    let client = ListingClient::with_base_url(&server.uri(), None).unwrap();
    let err = client.list_all("/Docs", 10).await.unwrap_err();

    assert!(matches!(err, ListingError::Api { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn missing_embedded_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/listing"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let client = ListingClient::with_base_url(&server.uri(), None).unwrap();
    let err = client.list_page("/Docs", 10, 0).await.unwrap_err();

    assert!(matches!(err, ListingError::MissingEmbedded));
    assert!(!err.is_retryable());
}
