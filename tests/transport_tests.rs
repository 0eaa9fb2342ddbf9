use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use orgmirror::error::is_not_found;
use orgmirror::transport::{GraphqlRequest, GraphqlTransport, HttpTransport};
use orgmirror::{ExecuteOptions, RequestExecutor};

fn transport(server: &MockServer) -> HttpTransport {
    HttpTransport::new(format!("{}/graphql", server.uri()), "t0ken", Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_posts_query_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("authorization", "Bearer t0ken"))
        .and(body_partial_json(json!({ "variables": { "org": "acme" } })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-RateLimit-Remaining", "4999")
                .set_body_json(json!({ "data": { "ok": true } })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let response = transport(&server)
        .send(&GraphqlRequest {
            query: "query OrgRepositories { x }".to_string(),
            variables: json!({ "org": "acme" }),
        })
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-ratelimit-remaining"), Some("4999"));
    assert_eq!(response.body, json!({ "data": { "ok": true } }));
}

#[tokio::test]
async fn test_non_json_body_is_kept_as_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("Retry-After", "120")
                .set_body_string("You have exceeded a secondary rate limit"),
        )
        .mount(&server)
        .await;

    let response = transport(&server)
        .send(&GraphqlRequest {
            query: "query Q { x }".to_string(),
            variables: Value::Null,
        })
        .await
        .unwrap();

    assert_eq!(response.status, 403);
    assert_eq!(response.header("Retry-After"), Some("120"));
    assert_eq!(
        response.body,
        Value::String("You have exceeded a secondary rate limit".to_string())
    );
}

#[tokio::test]
async fn test_executor_over_http_surfaces_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "node": null },
            "errors": [{ "type": "NOT_FOUND", "message": "Could not resolve to a node with the global id of 'X'" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let executor = RequestExecutor::new(Arc::new(transport(&server)));
    let err = executor
        .execute_raw("query SingleNode { x }", json!({ "id": "X" }), &ExecuteOptions::new("node X"))
        .await
        .unwrap_err();

    assert!(is_not_found(&err));
    assert!(err.to_string().contains("node X"));
}
