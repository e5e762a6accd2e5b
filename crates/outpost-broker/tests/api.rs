#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use outpost_broker::Broker;
use outpost_broker::api::{AppState, build_router};
use outpost_broker::storage::BrokerDatabase;
use outpost_core::{BrokerConfig, ManualClock};

const OPERATOR: &str = "operator-token-0123456789";
const T0: i64 = 1_700_000_000;

struct TestApp {
    router: axum::Router,
    clock: Arc<ManualClock>,
    payload_dir: tempfile::TempDir,
}

async fn app() -> TestApp {
    let db = BrokerDatabase::open_in_memory().await.unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let payload_dir = tempfile::tempdir().unwrap();
    let mut config = BrokerConfig::default();
    config.updates.payload_dir = payload_dir.path().to_path_buf();
    config.tunnel.slots = 2;
    let broker = Broker::new(db, clock.clone(), &config);
    TestApp {
        router: build_router(AppState::new(broker, OPERATOR)),
        clock,
        payload_dir,
    }
}

impl TestApp {
    /// Send a request and return (status, parsed JSON body or `Null`).
    async fn send(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn operator(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.send(method, uri, Some(OPERATOR), body).await
    }

    /// Issue a token and enroll a node, returning (node id, credential).
    async fn enroll(&self, hostname: &str) -> (i64, String) {
        let (status, issued) = self
            .operator(Method::POST, "/v1/enrollment-tokens", Some(json!({ "ttlDays": 7 })))
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, boot) = self
            .send(
                Method::POST,
                "/v1/enroll",
                None,
                Some(json!({ "token": issued["token"], "hostname": hostname })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{boot}");
        (
            boot["nodeId"].as_i64().unwrap(),
            boot["credential"].as_str().unwrap().to_string(),
        )
    }
}

#[tokio::test]
async fn healthz_is_open() {
    let app = app().await;
    let resp = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn operator_routes_require_token() {
    let app = app().await;
    let (status, body) = app.send(Method::GET, "/v1/nodes", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) = app
        .send(Method::GET, "/v1/nodes", Some("wrong-token"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app.operator(Method::GET, "/v1/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn node_routes_require_credential() {
    let app = app().await;
    let (status, _) = app
        .send(Method::POST, "/v1/agent/commands/poll", Some("bogus"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The operator token is not a node credential.
    let (status, _) = app
        .send(Method::POST, "/v1/agent/commands/poll", Some(OPERATOR), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn enrollment_token_is_single_use() {
    let app = app().await;
    let (_, issued) = app
        .operator(Method::POST, "/v1/enrollment-tokens", Some(json!({ "ttlDays": 1 })))
        .await;
    assert_eq!(issued["activeTokenCount"], 1);
    assert_eq!(issued["expiresAt"], T0 + 86_400);

    let enroll = json!({ "token": issued["token"], "hostname": "fw-a" });
    let (status, _) = app
        .send(Method::POST, "/v1/enroll", None, Some(enroll.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.send(Method::POST, "/v1/enroll", None, Some(enroll)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "TOKEN_ALREADY_USED");

    let (status, _) = app
        .operator(Method::POST, "/v1/enrollment-tokens", Some(json!({ "ttlDays": 31 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn expired_enrollment_token_is_gone() {
    let app = app().await;
    let (_, issued) = app
        .operator(Method::POST, "/v1/enrollment-tokens", Some(json!({ "ttlDays": 1 })))
        .await;
    app.clock.advance(86_400);

    let (status, body) = app
        .send(
            Method::POST,
            "/v1/enroll",
            None,
            Some(json!({ "token": issued["token"], "hostname": "fw-a" })),
        )
        .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "TOKEN_EXPIRED");
}

#[tokio::test]
async fn commands_flow_from_operator_to_node() {
    let app = app().await;
    let (node_id, cred) = app.enroll("fw-21").await;

    let (_, body) = app
        .send(Method::POST, "/v1/agent/commands/poll", Some(&cred), None)
        .await;
    assert_eq!(body, json!({ "hasCommand": false }));

    let uri = format!("/v1/nodes/{node_id}/commands");
    app.operator(Method::POST, &uri, Some(json!({ "command": "ping" })))
        .await;
    app.clock.advance(1);
    app.operator(Method::POST, &uri, Some(json!({ "command": "restart" })))
        .await;

    let (_, first) = app
        .send(Method::POST, "/v1/agent/commands/poll", Some(&cred), None)
        .await;
    assert_eq!(first["command"], "ping");
    let (_, second) = app
        .send(Method::POST, "/v1/agent/commands/poll", Some(&cred), None)
        .await;
    assert_eq!(second["command"], "restart");

    let result_uri = format!("/v1/agent/commands/{}/result", first["commandId"]);
    let (status, _) = app
        .send(
            Method::POST,
            &result_uri,
            Some(&cred),
            Some(json!({ "success": true, "output": "pong" })),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = app
        .operator(Method::POST, "/v1/nodes/999/commands", Some(json!({ "command": "ping" })))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn update_poll_offers_payload_digest() {
    let app = app().await;
    let (node_id, cred) = app.enroll("fw-a").await;
    std::fs::write(app.payload_dir.path().join("agent-2.0.0.run"), b"abc").unwrap();

    let (status, _) = app
        .operator(
            Method::POST,
            &format!("/v1/nodes/{node_id}/updates"),
            Some(json!({ "version": "2.0.0", "payloadRef": "agent-2.0.0.run" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, offer) = app
        .send(
            Method::POST,
            "/v1/agent/updates/poll",
            Some(&cred),
            Some(json!({ "agentVersion": "1.0.0" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(offer["updateAvailable"], true);
    assert_eq!(offer["currentVersion"], "1.0.0");
    assert_eq!(offer["newVersion"], "2.0.0");
    assert_eq!(offer["payloadSize"], 3);
    assert_eq!(
        offer["payloadSha256"],
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );

    let status_uri = format!("/v1/agent/updates/{}/status", offer["updateId"]);
    let (status, _) = app
        .send(
            Method::POST,
            &status_uri,
            Some(&cred),
            Some(json!({ "status": "installed" })),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, node) = app
        .operator(Method::GET, &format!("/v1/nodes/{node_id}"), None)
        .await;
    assert_eq!(node["agentVersion"], "2.0.0");

    let (_, none) = app
        .send(
            Method::POST,
            "/v1/agent/updates/poll",
            Some(&cred),
            Some(json!({ "agentVersion": "2.0.0" })),
        )
        .await;
    assert_eq!(none, json!({ "updateAvailable": false, "currentVersion": "2.0.0" }));
}

#[tokio::test]
async fn checkin_and_credential_rotation() {
    let app = app().await;
    let (node_id, cred) = app.enroll("fw-a").await;

    let (status, body) = app
        .send(
            Method::POST,
            "/v1/agent/checkin",
            Some(&cred),
            Some(json!({ "wanIp": "203.0.113.9" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checkinInterval"], 300);

    let (_, node) = app
        .operator(Method::GET, &format!("/v1/nodes/{node_id}"), None)
        .await;
    assert_eq!(node["status"], "online");
    assert_eq!(node["wanIp"], "203.0.113.9");
    assert!(node.get("credentialHash").is_none());

    let (_, rotated) = app
        .send(Method::POST, "/v1/agent/credential", Some(&cred), None)
        .await;
    let fresh = rotated["credential"].as_str().unwrap();
    let (status, _) = app
        .send(Method::POST, "/v1/agent/commands/poll", Some(&cred), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = app
        .send(Method::POST, "/v1/agent/commands/poll", Some(fresh), None)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn tunnel_lifecycle_and_stale_lookup() {
    let app = app().await;
    let (node_id, _) = app.enroll("fw-5").await;
    let tunnel_uri = format!("/v1/nodes/{node_id}/tunnel");

    let (status, _) = app.operator(Method::GET, &tunnel_uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, session) = app
        .operator(Method::POST, &tunnel_uri, Some(json!({ "ttlSecs": 600 })))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["tunnelPort"], 20_000);
    assert_eq!(session["secondaryPort"], 20_001);

    let (status, _) = app
        .operator(Method::POST, &tunnel_uri, Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    app.clock.advance(300);
    let (status, _) = app.operator(Method::GET, &tunnel_uri, None).await;
    assert_eq!(status, StatusCode::OK);

    app.clock.advance(400);
    let (status, body) = app.operator(Method::GET, &tunnel_uri, None).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "TUNNEL_STALE");

    let close_uri = format!("/v1/tunnels/{}", session["sessionId"]);
    let (status, _) = app.operator(Method::DELETE, &close_uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app.operator(Method::DELETE, &close_uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn exhausted_pool_is_service_unavailable() {
    let app = app().await;
    for name in ["fw-a", "fw-b"] {
        let (node_id, _) = app.enroll(name).await;
        let (status, _) = app
            .operator(Method::POST, &format!("/v1/nodes/{node_id}/tunnel"), Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }
    let (node_id, _) = app.enroll("fw-c").await;
    let (status, body) = app
        .operator(Method::POST, &format!("/v1/nodes/{node_id}/tunnel"), Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "TUNNEL_POOL_EXHAUSTED");
}

#[tokio::test]
async fn proxy_request_lifecycle() {
    let app = app().await;
    let (node_id, _) = app.enroll("fw-a").await;
    let (_, session) = app
        .operator(Method::POST, &format!("/v1/nodes/{node_id}/tunnel"), Some(json!({})))
        .await;

    let (status, queued) = app
        .operator(
            Method::POST,
            "/v1/proxy-requests",
            Some(json!({
                "nodeId": node_id,
                "tunnelPort": session["tunnelPort"],
                "action": { "method": "GET", "path": "/api/status" },
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let status_uri = format!("/v1/proxy-requests/{}", queued["requestId"]);

    let (_, view) = app.operator(Method::GET, &status_uri, None).await;
    assert_eq!(view["status"], "pending");

    let (_, claimed) = app
        .operator(Method::POST, "/v1/proxy-requests/claim", Some(json!({})))
        .await;
    assert_eq!(claimed["request"]["id"], queued["requestId"]);
    assert_eq!(claimed["request"]["action"]["path"], "/api/status");

    let (_, empty) = app
        .operator(Method::POST, "/v1/proxy-requests/claim", Some(json!({})))
        .await;
    assert_eq!(empty["request"], Value::Null);

    app.clock.advance(3);
    let (status, _) = app
        .operator(
            Method::POST,
            &format!("{status_uri}/complete"),
            Some(json!({ "success": true, "result": "200 OK" })),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, view) = app.operator(Method::GET, &status_uri, None).await;
    assert_eq!(view["status"], "completed");
    assert_eq!(view["completedAt"], T0 + 3);
    assert_eq!(view["result"], "200 OK");

    let (status, _) = app
        .operator(Method::GET, "/v1/proxy-requests/999", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn proxy_request_queues_before_tunnel_is_up() {
    let app = app().await;
    let (node_id, _) = app.enroll("fw-a").await;
    let (status, queued) = app
        .operator(
            Method::POST,
            "/v1/proxy-requests",
            Some(json!({ "nodeId": node_id, "tunnelPort": 20_000 })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, view) = app
        .operator(
            Method::GET,
            &format!("/v1/proxy-requests/{}", queued["requestId"]),
            None,
        )
        .await;
    assert_eq!(view["status"], "pending");

    let (status, body) = app
        .operator(
            Method::POST,
            "/v1/proxy-requests",
            Some(json!({ "nodeId": 999, "tunnelPort": 20_000 })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn bad_json_bodies_get_validation_errors() {
    let app = app().await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/enrollment-tokens")
        .header("authorization", format!("Bearer {OPERATOR}"))
        .header("content-type", "application/json")
        .body(Body::from("{\"ttlDays\": "))
        .unwrap();
    let resp = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "VALIDATION_ERROR");

    // No body and no content type.
    let (status, body) = app
        .operator(Method::POST, "/v1/enrollment-tokens", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    // Well-formed JSON of the wrong shape.
    let (status, body) = app
        .operator(
            Method::POST,
            "/v1/enrollment-tokens",
            Some(json!({ "ttlDays": "seven" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(body["error"].as_str().unwrap().contains("ttlDays"));
}

#[tokio::test]
async fn audit_log_lists_enrollments() {
    let app = app().await;
    app.enroll("fw-a").await;
    let (status, records) = app
        .operator(Method::GET, "/v1/audit?category=enrollment", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["message"], "Node 1 enrolled");
    assert_eq!(records[0]["details"]["hostname"], "fw-a");
}
