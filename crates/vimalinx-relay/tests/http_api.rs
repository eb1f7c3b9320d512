//! End-to-end HTTP tests against the in-process router.

use std::net::SocketAddr;

use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use vimalinx_relay::config::Config;
use vimalinx_relay::security::sign_request;
use vimalinx_relay::server::{AppState, build_app};
use vimalinx_relay_protocol::headers;

/// Light scrypt parameters to keep tests fast.
fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.auth.scrypt_log_n = 8;
    config.state.dir = dir.path().to_path_buf();
    config
}

async fn app_with(config: Config) -> (Router, AppState) {
    let state = AppState::open(config).await.unwrap();
    let app = build_app(state.clone()).layer(MockConnectInfo(SocketAddr::from((
        [127, 0, 0, 1],
        4242,
    ))));
    (app, state)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Register a user and mint a device token.
async fn register_and_token(app: &Router, user_id: &str) -> String {
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/register",
            json!({ "userId": user_id, "password": "hunter2hunter2" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/token",
            json!({ "userId": user_id, "password": "hunter2hunter2" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_and_public_config() {
    let dir = TempDir::new().unwrap();
    let (app, _state) = app_with(test_config(&dir)).await;

    let response = app.clone().oneshot(get("/healthz", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/api/config", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["registrationOpen"], json!(true));
    assert_eq!(body["inviteRequired"], json!(false));
}

#[tokio::test]
async fn message_round_trip_through_poll() {
    let dir = TempDir::new().unwrap();
    let (app, _state) = app_with(test_config(&dir)).await;
    let token = register_and_token(&app, "ana").await;

    // Token-based login works for the mobile client.
    let response = app
        .clone()
        .oneshot(post_json("/api/login", json!({ "token": token })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["userId"], json!("ana"));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/message")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(json!({ "text": "hello relay" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let posted = body_json(response).await;
    assert_eq!(posted["queued"], json!(true));
    assert_eq!(posted["chatId"], json!("user:ana"));

    let response = app
        .clone()
        .oneshot(get(
            &format!("/api/poll?waitMs=0&token={token}"),
            Some(&token),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let polled = body_json(response).await;
    let messages = polled["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["text"], json!("hello relay"));
    assert_eq!(messages[0]["chatId"], json!("user:ana"));

    // The queue is drained.
    let response = app
        .oneshot(get("/api/poll?waitMs=0", Some(&token)))
        .await
        .unwrap();
    let polled = body_json(response).await;
    assert!(polled["messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn instance_config_overrides_client_mode() {
    let dir = TempDir::new().unwrap();
    let (app, _state) = app_with(test_config(&dir)).await;
    let token = register_and_token(&app, "ana").await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/message")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "text": "configure me",
                        "chatId": "group:7",
                        "modelTierId": "pro",
                        "identityId": "e-commerce",
                        "modeId": "client-made-this-up",
                        "modelHint": "gigantic",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["modeId"], json!("inst_pro_e_commerce"));

    let response = app
        .clone()
        .oneshot(get("/api/poll?waitMs=0", Some(&token)))
        .await
        .unwrap();
    let polled = body_json(response).await;
    let message = &polled["messages"][0];
    assert_eq!(message["modeId"], json!("inst_pro_e_commerce"));
    assert_eq!(message["modelHint"], json!("advanced"));
    assert_eq!(message["agentHint"], json!("storefront"));

    // An unknown tier is rejected outright.
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/message")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "text": "bad tier",
                        "modelTierId": "ultra",
                        "identityId": "writing",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn outbound_send_lands_in_every_device_outbox() {
    let dir = TempDir::new().unwrap();
    let (app, state) = app_with(test_config(&dir)).await;
    let token = register_and_token(&app, "ana").await;

    // A second token means a second device key.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/token",
            json!({ "userId": "ana", "password": "hunter2hunter2" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/send")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(json!({ "text": "reply from gateway" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["delivered"], json!(2));

    for device_key in state.credentials.device_keys("ana") {
        assert_eq!(state.hub.latest_event_id(&device_key), 1);
    }

    // A user token may not address other users.
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/send")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(json!({ "to": "bob", "text": "nope" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn machine_id_conflict_across_users() {
    let dir = TempDir::new().unwrap();
    let (app, _state) = app_with(test_config(&dir)).await;
    let ana = register_and_token(&app, "ana").await;
    let bob = register_and_token(&app, "bob").await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/machine/register")
                .header("authorization", format!("Bearer {ana}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "machineId": "studio-box", "platform": "macos" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/machine/register")
                .header("authorization", format!("Bearer {bob}"))
                .header("content-type", "application/json")
                .body(Body::from(json!({ "machineId": "studio-box" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Bob cannot see or patch Ana's machine.
    let response = app
        .clone()
        .oneshot(get("/api/machines/studio-box", Some(&bob)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(get("/api/machines", Some(&ana)))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["machines"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn admin_provisions_user_and_machine() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.server.server_token = Some("srv-token".into());
    let (app, _state) = app_with(config).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/machines/contributors")
                .header("authorization", "Bearer srv-token")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "userId": "carol", "machineId": "carol-box" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["userId"], json!("carol"));
    assert_eq!(body["machineId"], json!("carol-box"));
    let token = body["token"].as_str().unwrap();
    assert!(body["password"].as_str().is_some());

    // The minted token authenticates immediately.
    let response = app
        .clone()
        .oneshot(get("/api/machine/config", Some(token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Without the server token the endpoint is closed.
    let response = app
        .oneshot(post_json(
            "/api/machines/contributors",
            json!({ "userId": "dave" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn replayed_signature_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.security.hmac_secret = Some("shared-secret".into());
    let (app, _state) = app_with(config).await;
    let token = register_and_token(&app, "ana").await;

    let body = json!({ "text": "signed hello" }).to_string();
    let ts = chrono::Utc::now().timestamp_millis();
    let signature = sign_request("shared-secret", ts, "nonce-1", body.as_bytes());

    let signed = |body: &str, signature: &str| {
        Request::builder()
            .method(Method::POST)
            .uri("/api/message")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .header(headers::TIMESTAMP, ts.to_string())
            .header(headers::NONCE, "nonce-1")
            .header(headers::SIGNATURE, signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    };

    let response = app.clone().oneshot(signed(&body, &signature)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Same nonce again: replay.
    let response = app.clone().oneshot(signed(&body, &signature)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let err = body_json(response).await;
    assert_eq!(err["error"]["code"], json!("replay_detected"));

    // An unsigned request is refused while a secret is configured.
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/message")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn oversized_body_is_rejected_before_decoding() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.security.max_payload_bytes = 64;
    config.server.server_token = Some("srv-token".into());
    let (app, _state) = app_with(config).await;

    // Malformed and oversized: the size gate must answer, not the JSON
    // decoder.
    let garbage = "x".repeat(200);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/machine/register")
                .header("content-type", "application/json")
                .body(Body::from(garbage.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    // Same ordering on the server-token send path.
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/send")
                .header("authorization", "Bearer srv-token")
                .header("content-type", "application/json")
                .body(Body::from(garbage))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn inbound_queues_to_the_primary_token_device_key() {
    let dir = TempDir::new().unwrap();
    let (app, _state) = app_with(test_config(&dir)).await;
    let primary = register_and_token(&app, "ana").await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/token",
            json!({ "userId": "ana", "password": "hunter2hunter2" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let secondary = body_json(response).await["token"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/message")
                .header("authorization", format!("Bearer {secondary}"))
                .header("content-type", "application/json")
                .body(Body::from(json!({ "text": "routed" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A poll holding the secondary token drains nothing; the message sits
    // on the primary token's device key.
    let response = app
        .clone()
        .oneshot(get("/api/poll?waitMs=0", Some(&secondary)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await["messages"]
        .as_array()
        .unwrap()
        .is_empty());

    let response = app
        .oneshot(get("/api/poll?waitMs=0", Some(&primary)))
        .await
        .unwrap();
    let polled = body_json(response).await;
    let messages = polled["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["text"], json!("routed"));
}

#[tokio::test]
async fn rate_limit_returns_429() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.security.rate_limit_per_minute = 2;
    let (app, _state) = app_with(config).await;
    let token = register_and_token(&app, "ana").await;

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(get("/api/poll?waitMs=0", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .oneshot(get("/api/poll?waitMs=0", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let err = body_json(response).await;
    assert_eq!(err["error"]["code"], json!("too_many_requests"));
}

#[tokio::test]
async fn query_token_requires_opt_in() {
    let dir = TempDir::new().unwrap();

    // Default: query tokens are refused.
    let (app, _state) = app_with(test_config(&dir)).await;
    let token = register_and_token(&app, "ana").await;
    let response = app
        .oneshot(get(&format!("/api/poll?waitMs=0&token={token}"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Opted in: the same request passes.
    let dir2 = TempDir::new().unwrap();
    let mut config = test_config(&dir2);
    config.security.allow_token_in_query = true;
    let (app, _state) = app_with(config).await;
    let token = register_and_token(&app, "ana").await;
    let response = app
        .oneshot(get(&format!("/api/poll?waitMs=0&token={token}"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn registration_gating() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.registration.invite_codes = vec!["golden-ticket".into()];
    config.server.server_token = Some("srv-token".into());
    let (app, _state) = app_with(config).await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/register",
            json!({ "userId": "ana", "password": "hunter2hunter2" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/register",
            json!({
                "userId": "ana",
                "password": "hunter2hunter2",
                "inviteCode": "golden-ticket",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The server token bypasses the invite gate.
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/register")
                .header("authorization", "Bearer srv-token")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "userId": "bob", "password": "hunter2hunter2" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
