//! Control API integration tests driven through the router directly.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use anser::api::{ApiServer, ApiServerConfig};
use anser::database::Db;
use anser::events::EventBus;
use anser::logs::LogBuffer;
use anser::secrets::SecretStore;
use anser::server::manager::TunnelManager;

async fn test_router() -> (axum::Router, Arc<TunnelManager>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open_in_memory().await.unwrap();
    let secrets = SecretStore::open(dir.path()).unwrap();
    let manager = TunnelManager::new(db, secrets, EventBus::new(), Arc::new(LogBuffer::new()));
    manager.init().await.unwrap();

    let server = ApiServer::new(ApiServerConfig::default(), manager.clone());
    (server.build_router(), manager, dir)
}

async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn server_body(name: &str, host: &str) -> Value {
    json!({
        "name": name,
        "host": host,
        "sshPort": 22,
        "username": "u",
        "authType": "password",
        "socksPort": 11080,
        "password": "p"
    })
}

#[tokio::test]
async fn ping_reports_uptime() {
    let (router, _manager, _dir) = test_router().await;
    let (status, body) = send(&router, get("/ping")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pong"], true);
    assert!(body["uptime"].is_u64());
}

#[tokio::test]
async fn server_crud_roundtrip() {
    let (router, _manager, _dir) = test_router().await;

    let (status, body) = send(&router, post_json("/servers/add", server_body("S", "h1"))).await;
    assert_eq!(status, StatusCode::OK);
    let id = body["id"].as_str().unwrap().to_string();
    assert!(!id.is_empty());

    let (status, body) = send(&router, get("/servers")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["servers"][0]["name"], "S");
    // Secrets never leak through the listing.
    assert!(body["servers"][0].get("password").is_none());

    let update = Request::builder()
        .method("PUT")
        .uri(format!("/servers/{id}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "name": "renamed" }).to_string()))
        .unwrap();
    let (status, body) = send(&router, update).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["server"]["name"], "renamed");

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/servers/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, delete).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&router, get("/servers")).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn duplicate_endpoint_is_rejected() {
    let (router, _manager, _dir) = test_router().await;
    let (status, _) = send(&router, post_json("/servers/add", server_body("a", "same"))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&router, post_json("/servers/add", server_body("b", "same"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("already exists"));
}

#[tokio::test]
async fn validation_rejects_port_zero() {
    let (router, _manager, _dir) = test_router().await;
    let mut body = server_body("S", "h");
    body["socksPort"] = json!(0);
    let (status, resp) = send(&router, post_json("/servers/add", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(resp["error"].as_str().unwrap().contains("socksPort"));

    // Boundary ports are accepted.
    let mut body = server_body("S2", "h2");
    body["socksPort"] = json!(65535);
    body["sshPort"] = json!(1);
    let (status, _) = send(&router, post_json("/servers/add", body)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn export_import_identity_with_dedup() {
    let (router, _manager, _dir) = test_router().await;
    send(&router, post_json("/servers/add", server_body("A", "h1"))).await;
    send(&router, post_json("/servers/add", server_body("B", "h2"))).await;

    let (status, export) = send(&router, get("/export?includeKeys=true")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(export["count"], 2);
    assert_eq!(export["includesKeys"], true);
    assert_eq!(export["servers"][0]["password"], "p");

    // Re-importing the same export is a no-op thanks to endpoint dedup.
    let (status, result) = send(
        &router,
        post_json("/import", json!({ "servers": export["servers"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["imported"], 0);
    assert_eq!(result["skipped"], 2);

    // A bare array with one new and one known server imports only the new.
    let mut extra = server_body("C", "h3");
    extra["socksPort"] = json!(11081);
    let (status, result) = send(
        &router,
        post_json("/import", json!([server_body("A", "h1"), extra])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["imported"], 1);
    assert_eq!(result["skipped"], 1);

    let (_, body) = send(&router, get("/servers")).await;
    assert_eq!(body["count"], 3);
}

#[tokio::test]
async fn export_without_keys_holds_no_secrets() {
    let (router, _manager, _dir) = test_router().await;
    send(&router, post_json("/servers/add", server_body("A", "h1"))).await;
    let (_, export) = send(&router, get("/export")).await;
    assert_eq!(export["includesKeys"], false);
    assert!(export["servers"][0].get("password").is_none());
    assert!(export["servers"][0].get("privateKey").is_none());
}

#[tokio::test]
async fn profiles_crud() {
    let (router, _manager, _dir) = test_router().await;
    let (_, body) = send(&router, post_json("/servers/add", server_body("S", "h"))).await;
    let server_id = body["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &router,
        post_json(
            "/profiles/add",
            json!({ "serverId": server_id, "displayName": "fast", "socksPortOverride": 21080 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let profile_id = body["id"].as_str().unwrap().to_string();

    let (_, body) = send(&router, get("/profiles")).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["profiles"][0]["socksPortOverride"], 21080);

    // Profiles for unknown servers are refused.
    let (status, _) = send(
        &router,
        post_json("/profiles/add", json!({ "serverId": "nope", "displayName": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/profiles/{profile_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, delete).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&router, get("/profiles")).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn stats_rejects_unknown_period() {
    let (router, _manager, _dir) = test_router().await;
    let (status, body) = send(&router, get("/stats/some-id?period=2w")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("period"));

    let (status, body) = send(&router, get("/stats/some-id?period=1h")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["uptimePercent"], 0.0);
}

#[tokio::test]
async fn auth_guards_everything_but_ping() {
    let (router, manager, _dir) = test_router().await;
    manager.set_auth_enabled(true).await.unwrap();
    let (_, token) = manager.auth_config();

    let (status, _) = send(&router, get("/status")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // /ping stays public.
    let (status, _) = send(&router, get("/ping")).await;
    assert_eq!(status, StatusCode::OK);

    let bearer = Request::builder()
        .uri("/status")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, bearer).await;
    assert_eq!(status, StatusCode::OK);

    // Query-string token works too.
    let (status, _) = send(&router, get(&format!("/status?token={token}"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&router, get("/status?token=wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn token_regeneration_invalidates_old_token() {
    let (router, manager, _dir) = test_router().await;
    manager.set_auth_enabled(true).await.unwrap();
    let (_, old_token) = manager.auth_config();

    let regen = Request::builder()
        .method("POST")
        .uri("/token/regenerate")
        .header(header::AUTHORIZATION, format!("Bearer {old_token}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&router, regen).await;
    assert_eq!(status, StatusCode::OK);
    let new_token = body["token"].as_str().unwrap().to_string();
    assert_ne!(new_token, old_token);
    assert_eq!(new_token.len(), 32); // 16 bytes hex

    let (status, _) = send(&router, get(&format!("/status?token={old_token}"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&router, get(&format!("/status?token={new_token}"))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn connect_unknown_server_is_404() {
    let (router, _manager, _dir) = test_router().await;
    let (status, body) = send(&router, post_json("/connect/ghost", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn help_lists_endpoints() {
    let (router, _manager, _dir) = test_router().await;
    let (status, body) = send(&router, get("/help")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["endpoints"].as_array().unwrap().len() > 10);
}

#[tokio::test]
async fn settings_roundtrip_and_validation() {
    let (router, _manager, _dir) = test_router().await;
    let (_, body) = send(&router, get("/settings")).await;
    assert_eq!(body["keepaliveIntervalSecs"], 15);

    let put = Request::builder()
        .method("PUT")
        .uri("/settings")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "keepaliveIntervalSecs": 30,
                "connectTimeoutSecs": 10,
                "autoReconnectDefault": false
            })
            .to_string(),
        ))
        .unwrap();
    let (status, body) = send(&router, put).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["keepaliveIntervalSecs"], 30);

    let put = Request::builder()
        .method("PUT")
        .uri("/settings")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "keepaliveIntervalSecs": 0,
                "connectTimeoutSecs": 10,
                "autoReconnectDefault": true
            })
            .to_string(),
        ))
        .unwrap();
    let (status, _) = send(&router, put).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
