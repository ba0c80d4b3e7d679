//! Integration tests driving the full router via `tower::ServiceExt::oneshot`,
//! covering the scenarios in spec §8 (S1-S3, S5-S6) against a tempfile-backed
//! `SqliteStore` and an in-memory fake broker.

use std::sync::Arc;
use std::time::Duration;

use agent_backup_control_plane::broker::{BrokerError, ObjectBroker};
use agent_backup_control_plane::config::{Settings, StoreMode};
use agent_backup_control_plane::routes::router;
use agent_backup_control_plane::state::AppState;
use agent_backup_control_plane::store::sqlite::SqliteStore;
use agent_backup_control_plane::store::Store;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

#[derive(Debug, Default)]
struct FakeBroker;

#[async_trait]
impl ObjectBroker for FakeBroker {
    async fn presign_put(
        &self,
        key: &str,
        _content_type: &str,
        _content_length: i64,
        _expiry: Duration,
    ) -> Result<String, BrokerError> {
        Ok(format!("https://fake-store.test/{key}?op=put"))
    }

    async fn presign_put_unbound(
        &self,
        key: &str,
        _content_type: &str,
        _expiry: Duration,
    ) -> Result<String, BrokerError> {
        Ok(format!("https://fake-store.test/{key}?op=put"))
    }

    async fn presign_get(&self, key: &str, _expiry: Duration) -> Result<String, BrokerError> {
        Ok(format!("https://fake-store.test/{key}?op=get"))
    }

    async fn delete(&self, _key: &str) -> Result<(), BrokerError> {
        Ok(())
    }
}

fn test_settings(min_backup_interval_hours: i64) -> Settings {
    Settings {
        listen_addr: "0.0.0.0:0".to_string(),
        store_mode: StoreMode::Sql,
        database_path: String::new(),
        kv_agents_table: "agents".to_string(),
        kv_backups_table: "backups".to_string(),
        kv_token_index: "token_hash-index".to_string(),
        kv_region: "us-east-1".to_string(),
        kv_endpoint: None,
        object_endpoint: "localhost:9000".to_string(),
        object_public_endpoint: None,
        object_region: "us-east-1".to_string(),
        object_bucket: "agent-backups".to_string(),
        object_access_key: String::new(),
        object_secret_key: String::new(),
        object_insecure: true,
        admin_api_keys: Vec::new(),
        default_quota_bytes: 1024,
        max_upload_bytes: 5 * 1024 * 1024,
        min_backup_interval_hours,
        max_backups_per_agent: 7,
        max_pending_agents: 100,
        register_rate_limit: 10,
        presign_expiry_seconds: 900,
        retention_days: 7,
        delete_grace_hours: 72,
        purge_interval_seconds: 1,
    }
}

/// `min_backup_interval_hours` is parameterized: most scenarios don't care
/// about the frequency gate and would otherwise trip over it incidentally
/// when issuing several uploads back-to-back within a single test.
async fn test_app(min_backup_interval_hours: i64) -> axum::Router {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("control-plane.db");
    // Leak the tempdir so the file outlives the test; each test gets its own file.
    std::mem::forget(dir);

    let store = SqliteStore::open(db_path.to_str().unwrap())
        .await
        .expect("open sqlite store");
    let settings = Arc::new(test_settings(min_backup_interval_hours));
    let state = AppState::new(Arc::new(store), Arc::new(FakeBroker), settings);
    router(state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(t) = token {
        builder = builder.header("authorization", format!("Bearer {t}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn register(app: &axum::Router, name: &str) -> (String, String) {
    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/agents/register",
            None,
            json!({"agent_name": name}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = body_json(resp).await;
    (
        body["agent_id"].as_str().unwrap().to_string(),
        body["token"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn healthz_returns_ok() {
    let app = test_app(12).await;
    let resp = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

/// S1: a pending agent cannot upload; after admin approval it can.
#[tokio::test]
async fn pending_agent_cannot_upload_until_approved() {
    let app = test_app(12).await;
    let (agent_id, token) = register(&app, "agent-a").await;

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/backups/upload-url",
            Some(&token),
            json!({"timestamp": "2026-02-22T030000Z", "encrypted_bytes": 100}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "pending");

    let approve = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/admin/agents/{agent_id}/approve"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(approve.status(), StatusCode::OK);

    let resp = app
        .oneshot(json_request(
            "POST",
            "/v1/backups/upload-url",
            Some(&token),
            json!({"timestamp": "2026-02-22T030000Z", "encrypted_bytes": 100}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert!(body["urls"]["backup.ciphertext"].is_string());
    assert!(body["urls"]["manifest.meta"].is_string());
}

async fn approve(app: &axum::Router, agent_id: &str) {
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/admin/agents/{agent_id}/approve"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

/// S2: quota enforcement at the byte boundary.
#[tokio::test]
async fn quota_is_enforced_at_the_boundary() {
    // Frequency gate disabled here so two rapid uploads isolate quota behavior.
    let app = test_app(0).await;
    let (agent_id, token) = register(&app, "agent-b").await;
    approve(&app, &agent_id).await;

    // default_quota_bytes = 1024 in test settings; first backup uses 900.
    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/backups/upload-url",
            Some(&token),
            json!({"timestamp": "t0", "encrypted_bytes": 900}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/backups/upload-url",
            Some(&token),
            json!({"timestamp": "t1", "encrypted_bytes": 200}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app
        .oneshot(json_request(
            "POST",
            "/v1/backups/upload-url",
            Some(&token),
            json!({"timestamp": "t1", "encrypted_bytes": 124}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

/// S5: soft-delete then undelete restores visibility and used_bytes.
#[tokio::test]
async fn soft_delete_then_undelete_restores_visibility() {
    let app = test_app(12).await;
    let (agent_id, token) = register(&app, "agent-c").await;
    approve(&app, &agent_id).await;

    app.clone()
        .oneshot(json_request(
            "POST",
            "/v1/backups/upload-url",
            Some(&token),
            json!({"timestamp": "b1", "encrypted_bytes": 100}),
        ))
        .await
        .unwrap();

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/v1/backups/b1")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let list = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/backups")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(list).await;
    assert_eq!(body["count"], 0);

    let undelete = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/backups/b1/undelete")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(undelete.status(), StatusCode::OK);

    let get = app
        .oneshot(
            Request::builder()
                .uri("/v1/backups/b1")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get.status(), StatusCode::OK);
}

/// S6: token rotation invalidates the old token immediately.
#[tokio::test]
async fn token_rotation_invalidates_old_token() {
    let app = test_app(12).await;
    let (_agent_id, token) = register(&app, "agent-d").await;

    let rotate = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/agents/me/rotate-token")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rotate.status(), StatusCode::OK);
    let body = body_json(rotate).await;
    let new_token = body["token"].as_str().unwrap().to_string();
    assert_ne!(new_token, token);

    let old = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/agents/me")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(old.status(), StatusCode::UNAUTHORIZED);

    let fresh = app
        .oneshot(
            Request::builder()
                .uri("/v1/agents/me")
                .header("authorization", format!("Bearer {new_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(fresh.status(), StatusCode::OK);
}

/// S3: the minimum backup interval rejects a too-soon follow-up backup.
#[tokio::test]
async fn frequency_limit_rejects_too_soon_backup() {
    let app = test_app(12).await;
    let (agent_id, token) = register(&app, "agent-e").await;
    approve(&app, &agent_id).await;

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/backups/upload-url",
            Some(&token),
            json!({"timestamp": "2026-02-22T030000Z", "encrypted_bytes": 10}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // default_quota_bytes=1024, min_backup_interval_hours=12: the newest
    // backup was just created, so a different timestamp immediately after
    // must be rejected as too frequent.
    let resp = app
        .oneshot(json_request(
            "POST",
            "/v1/backups/upload-url",
            Some(&token),
            json!({"timestamp": "2026-02-22T040000Z", "encrypted_bytes": 10}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
}

/// S4: once the per-agent backup cap is exceeded, rotation soft-deletes
/// the oldest surplus record and keeps the newest ones.
#[tokio::test]
async fn rotation_auto_purges_oldest_backup_over_the_cap() {
    let mut settings = test_settings(0);
    settings.max_backups_per_agent = 2;
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("control-plane.db");
    std::mem::forget(dir);
    let store = SqliteStore::open(db_path.to_str().unwrap()).await.expect("open sqlite store");
    let state = AppState::new(Arc::new(store), Arc::new(FakeBroker), Arc::new(settings));
    let app = router(state);

    let (agent_id, token) = register(&app, "agent-f").await;
    approve(&app, &agent_id).await;

    for ts in ["T1", "T2", "T3"] {
        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/backups/upload-url",
                Some(&token),
                json!({"timestamp": ts, "encrypted_bytes": 10}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let list = app
        .oneshot(
            Request::builder()
                .uri("/v1/backups")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(list).await;
    assert_eq!(body["count"], 2);
    let timestamps: Vec<String> = body["backups"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["timestamp"].as_str().unwrap().to_string())
        .collect();
    assert!(timestamps.contains(&"T3".to_string()));
    assert!(timestamps.contains(&"T2".to_string()));
    assert!(!timestamps.contains(&"T1".to_string()));
}

/// S5 continuation: `DELETE /v1/backups` soft-deletes every visible backup.
#[tokio::test]
async fn delete_all_soft_deletes_every_visible_backup() {
    let app = test_app(0).await;
    let (agent_id, token) = register(&app, "agent-g").await;
    approve(&app, &agent_id).await;

    for ts in ["t0", "t1"] {
        app.clone()
            .oneshot(json_request(
                "POST",
                "/v1/backups/upload-url",
                Some(&token),
                json!({"timestamp": ts, "encrypted_bytes": 10}),
            ))
            .await
            .unwrap();
    }

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/v1/backups")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["deleted"], 2);

    let list = app
        .oneshot(
            Request::builder()
                .uri("/v1/backups")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(list).await;
    assert_eq!(body["count"], 0);
}

/// Invariant 5: after `suspend`, mutating calls are rejected with 403;
/// reads (agent info) remain available.
#[tokio::test]
async fn suspended_agent_is_blocked_from_mutating_endpoints() {
    let app = test_app(12).await;
    let (agent_id, token) = register(&app, "agent-h").await;
    approve(&app, &agent_id).await;

    let suspend = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/admin/agents/{agent_id}/suspend"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(suspend.status(), StatusCode::OK);

    let upload = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/backups/upload-url",
            Some(&token),
            json!({"timestamp": "t0", "encrypted_bytes": 10}),
        ))
        .await
        .unwrap();
    assert_eq!(upload.status(), StatusCode::FORBIDDEN);
    let body = body_json(upload).await;
    assert_eq!(body["status"], "suspended");

    // Reads stay available to a suspended agent so it can observe its state.
    let me = app
        .oneshot(
            Request::builder()
                .uri("/v1/agents/me")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(me.status(), StatusCode::OK);
}

/// Boundary behaviour (spec §8): `encrypted_bytes` at 0, at the cap, and
/// one over the cap. `default_quota_bytes` is raised well past
/// `max_upload_bytes` here so the at-cap request actually exercises the
/// size boundary instead of tripping the quota check first.
#[tokio::test]
async fn encrypted_bytes_boundary_values() {
    let mut settings = test_settings(0);
    settings.default_quota_bytes = 16 * 1024 * 1024;
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("control-plane.db");
    std::mem::forget(dir);
    let store = SqliteStore::open(db_path.to_str().unwrap()).await.expect("open sqlite store");
    let state = AppState::new(Arc::new(store), Arc::new(FakeBroker), Arc::new(settings));
    let app = router(state);

    let (agent_id, token) = register(&app, "agent-i").await;
    approve(&app, &agent_id).await;

    let zero = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/backups/upload-url",
            Some(&token),
            json!({"timestamp": "t0", "encrypted_bytes": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(zero.status(), StatusCode::BAD_REQUEST);

    // max_upload_bytes = 5 MiB in test settings; exactly at the cap is accepted.
    let at_cap = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/backups/upload-url",
            Some(&token),
            json!({"timestamp": "t1", "encrypted_bytes": 5 * 1024 * 1024}),
        ))
        .await
        .unwrap();
    assert_eq!(at_cap.status(), StatusCode::OK);

    let over_cap = app
        .oneshot(json_request(
            "POST",
            "/v1/backups/upload-url",
            Some(&token),
            json!({"timestamp": "t2", "encrypted_bytes": 5 * 1024 * 1024 + 1}),
        ))
        .await
        .unwrap();
    assert_eq!(over_cap.status(), StatusCode::BAD_REQUEST);
}

/// Admin endpoints are gated by `X-API-Key` when any key is configured.
#[tokio::test]
async fn admin_key_gates_admin_endpoints_when_configured() {
    let mut settings = test_settings(12);
    settings.admin_api_keys = vec!["secret-key".to_string()];
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("control-plane.db");
    std::mem::forget(dir);
    let store = SqliteStore::open(db_path.to_str().unwrap()).await.expect("open sqlite store");
    let state = AppState::new(Arc::new(store), Arc::new(FakeBroker), Arc::new(settings));
    let app = router(state);

    let no_key = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/admin/agents")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(no_key.status(), StatusCode::UNAUTHORIZED);

    let wrong_key = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/admin/agents")
                .header("x-api-key", "not-it")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(wrong_key.status(), StatusCode::UNAUTHORIZED);

    let right_key = app
        .oneshot(
            Request::builder()
                .uri("/v1/admin/agents")
                .header("x-api-key", "secret-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(right_key.status(), StatusCode::OK);
}

/// §4.5: registration is blocked once `max_pending_agents` pending agents
/// already exist.
#[tokio::test]
async fn pending_flood_returns_503() {
    let mut settings = test_settings(12);
    settings.max_pending_agents = 1;
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("control-plane.db");
    std::mem::forget(dir);
    let store = SqliteStore::open(db_path.to_str().unwrap()).await.expect("open sqlite store");
    let state = AppState::new(Arc::new(store), Arc::new(FakeBroker), Arc::new(settings));
    let app = router(state);

    let (_agent_id, _token) = register(&app, "agent-j").await;

    let resp = app
        .oneshot(json_request(
            "POST",
            "/v1/agents/register",
            None,
            json!({"agent_name": "agent-k"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

/// Registration is rate-limited per client IP (no `X-Forwarded-For` here,
/// so every request in this test shares the oneshot harness's fallback
/// "unknown" key).
#[tokio::test]
async fn register_rate_limit_returns_429_after_the_budget() {
    let mut settings = test_settings(12);
    settings.register_rate_limit = 2;
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("control-plane.db");
    std::mem::forget(dir);
    let store = SqliteStore::open(db_path.to_str().unwrap()).await.expect("open sqlite store");
    let state = AppState::new(Arc::new(store), Arc::new(FakeBroker), Arc::new(settings));
    let app = router(state);

    for name in ["a", "b"] {
        let resp = app
            .clone()
            .oneshot(json_request("POST", "/v1/agents/register", None, json!({"agent_name": name})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    let resp = app
        .oneshot(json_request("POST", "/v1/agents/register", None, json!({"agent_name": "agent-over"}))
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let headers = resp.headers().clone();
    assert_eq!(headers.get("retry-after").unwrap(), "60");
}
