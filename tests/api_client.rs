use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::Query,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use gameserver_agent::api_client::ApiClient;
use gameserver_agent::error::ApiError;
use serde::Deserialize;
use serde_json::{json, Value};

// "admin:secret"
const EXPECTED_AUTH: &str = "Basic YWRtaW46c2VjcmV0";

async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn test_api() -> Router {
    Router::new()
        .route(
            "/v1/api/info",
            get(|headers: HeaderMap| async move {
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some(EXPECTED_AUTH);
                if authorized {
                    (
                        StatusCode::OK,
                        Json(json!({ "Version": "v0.5.1", "serverName": "Home", "worldGuid": "ABC" })),
                    )
                } else {
                    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })))
                }
            }),
        )
        .route("/v1/api/fail", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }))
        .route("/v1/api/garbage", get(|| async { "definitely not json" }))
        .route(
            "/v1/api/echo",
            get(|Query(q): Query<HashMap<String, String>>| async move { Json(json!({ "Message": q.get("message") })) }),
        )
        .route("/v1/api/announce", post(|Json(body): Json<Value>| async move { Json(body) }))
        .route("/v1/api/save", post(|| async { StatusCode::OK }))
}

#[derive(Debug, Deserialize)]
struct Info {
    version: String,
    servername: String,
    worldguid: String,
}

#[tokio::test]
async fn basic_auth_and_case_insensitive_fields() {
    let addr = spawn_server(test_api()).await;
    let base = format!("http://{}/v1/api/", addr);

    let client = ApiClient::new(&base, Duration::from_secs(5))
        .unwrap()
        .with_basic_auth("admin", "secret");
    let info: Info = client.get("info", &[]).await.unwrap();
    assert_eq!(info.version, "v0.5.1");
    assert_eq!(info.servername, "Home");
    assert_eq!(info.worldguid, "ABC");

    let anonymous = ApiClient::new(&base, Duration::from_secs(5)).unwrap();
    let err = anonymous.get::<Info>("info", &[]).await.unwrap_err();
    assert_eq!(err.status(), Some(401));
    assert!(!err.is_connection());
}

#[tokio::test]
async fn non_success_status_carries_code_and_body() {
    let addr = spawn_server(test_api()).await;
    let client = ApiClient::new(&format!("http://{}/v1/api", addr), Duration::from_secs(5)).unwrap();

    match client.get::<Value>("fail", &[]).await {
        Err(ApiError::Http { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("expected http fault, got {other:?}"),
    }
}

#[tokio::test]
async fn unexpected_payload_is_a_deserialize_fault() {
    let addr = spawn_server(test_api()).await;
    let client = ApiClient::new(&format!("http://{}/v1/api", addr), Duration::from_secs(5)).unwrap();

    match client.get::<Info>("garbage", &[]).await {
        Err(ApiError::Deserialize { body, .. }) => assert_eq!(body, "definitely not json"),
        other => panic!("expected deserialize fault, got {other:?}"),
    }
}

#[tokio::test]
async fn query_and_body_are_sent() {
    let addr = spawn_server(test_api()).await;
    let client = ApiClient::new(&format!("http://{}/v1/api", addr), Duration::from_secs(5)).unwrap();

    let echoed: Value = client.get("echo", &[("message", "hello & welcome")]).await.unwrap();
    assert_eq!(echoed["message"], "hello & welcome");

    let announced: Value = client
        .post("announce", &json!({ "Message": "restart in 5" }), &[])
        .await
        .unwrap();
    assert_eq!(announced["message"], "restart in 5");

    // empty 200 bodies are accepted for unit responses
    let _: () = client.post("save", &json!({}), &[]).await.unwrap();
}

#[tokio::test]
async fn unreachable_api_is_a_connection_fault() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = ApiClient::new(&format!("http://{}/v1/api", addr), Duration::from_secs(5)).unwrap();
    let err = client.get::<Value>("info", &[]).await.unwrap_err();
    assert!(err.is_connection(), "expected connection fault, got {err:?}");
}
