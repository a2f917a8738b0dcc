//! Requests against the router with an in-memory remote behind it.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use blockbridge_core::{parse, to_remote};
use blockbridge_server::auth::{create_token, AuthConfig, Capability};
use blockbridge_server::consumer;
use blockbridge_server::ratelimit::RateLimitConfig;
use blockbridge_server::{router, AppState};
use blockbridge_store::{queue, NewEntry, Store};
use blockbridge_sync::{sign, Executor, FakeRemote};
use blockbridge_types::{BlockId, ChangeType, QueueStatus};
use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &str = "whsec";

struct App {
    vault: TempDir,
    remote: Arc<FakeRemote>,
    executor: Arc<Executor>,
    page: String,
    router: Router,
}

impl App {
    fn new() -> Self {
        Self::with(AuthConfig::default(), RateLimitConfig::default())
    }

    fn with(auth: AuthConfig, rate_limit: RateLimitConfig) -> Self {
        Self::build(auth, rate_limit, Some(SECRET))
    }

    fn build(auth: AuthConfig, rate_limit: RateLimitConfig, secret: Option<&str>) -> Self {
        let vault = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_memory().unwrap());
        let remote = Arc::new(FakeRemote::new());
        let page = remote.create_page();
        let executor = Arc::new(Executor::new(store, remote.clone(), vault.path()));
        let (state, _wake) = AppState::new(executor.clone(), secret.map(Into::into), rate_limit, 30);
        let router = router(state, auth.state());
        Self {
            vault,
            remote,
            executor,
            page,
            router,
        }
    }

    fn write(&self, path: &str, text: &str) {
        std::fs::write(self.vault.path().join(path), text).unwrap();
    }

    fn read(&self, path: &str) -> String {
        std::fs::read_to_string(self.vault.path().join(path)).unwrap()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        });
        (status, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(json_request("POST", uri, &body, None)).await
    }

    async fn push(&self, path: &str) -> (StatusCode, Value) {
        self.post(
            "/notion/sync/to-notion",
            json!({ "page_id": self.page, "local_path": path }),
        )
        .await
    }
}

fn json_request(method: &str, uri: &str, body: &Value, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn webhook_request(body: &Value, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::post("/notion/webhook").header(header::CONTENT_TYPE, "application/json");
    if let Some(sig) = signature {
        builder = builder.header("X-Notion-Signature", sig);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn text_of(payload: &Value) -> String {
    let remote_type = payload["type"].as_str().unwrap_or_default();
    payload[remote_type]["rich_text"]
        .as_array()
        .map(|items| items.iter().filter_map(|i| i["plain_text"].as_str()).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_healthz_and_description() {
    let app = App::new();
    let (status, body) = app.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ok".into()));

    let (status, body) = app.get("/notion").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "blockbridge");
    assert_eq!(body["webhook_signatures"], true);
}

#[tokio::test]
async fn test_push_then_status_queue_and_maps() {
    let app = App::new();
    app.write("cave.md", "# Cave\n\nDark and damp.\n");

    let (status, report) = app.push("cave.md").await;
    assert_eq!(status, StatusCode::OK, "{report}");
    assert_eq!(report["inserted"], 2);
    assert_eq!(report["failed"], 0);

    let (_, counts) = app.get("/notion/sync/status").await;
    assert_eq!(counts["successCount"], 2);
    assert_eq!(counts["pendingCount"], 0);
    assert_eq!(counts["errorCount"], 0);
    assert_eq!(counts["conflictCount"], 0);
    assert_eq!(counts["documents"]["cave.md"], "idle");

    let (_, entries) = app.get("/notion/sync/queue?limit=1").await;
    assert_eq!(entries.as_array().unwrap().len(), 1);

    let (status, maps) = app.get("/notion/maps").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(maps.as_array().unwrap().len(), 2);
    assert!(maps
        .as_array()
        .unwrap()
        .iter()
        .all(|m| m["local_path"] == "cave.md"));
}

#[tokio::test]
async fn test_pull_writes_the_document() {
    let app = App::new();
    for text in ["# Harbor", "Gulls everywhere."] {
        let payload = to_remote(&parse(text).unwrap()[0]).unwrap();
        app.remote.push_block(&app.page, &payload);
    }

    let (status, report) = app
        .post(
            "/notion/sync/from-notion",
            json!({ "page_id": app.page, "output_path": "towns/harbor.md" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{report}");
    assert_eq!(report["inserted"], 2);
    let pulled = app.read("towns/harbor.md");
    assert!(pulled.starts_with("# Harbor"));
    assert!(pulled.contains("Gulls everywhere."));

    // The page is linked now, so it cannot be pulled into a second path
    let (status, _) = app
        .post(
            "/notion/sync/from-notion",
            json!({ "page_id": app.page, "output_path": "copy.md" }),
        )
        .await;
    assert!(status.is_server_error() || status.is_client_error());
}

#[tokio::test]
async fn test_bad_paths_and_missing_documents() {
    let app = App::new();
    let (status, _) = app.push("../outside.md").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.push("missing.md").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_concurrent_sync_is_rejected() {
    let app = App::new();
    app.write("cave.md", "Alpha\n");
    let _held = app.executor.locks().try_acquire("cave.md").unwrap();

    let (status, body) = app.push("cave.md").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already in progress"));

    let (_, counts) = app.get("/notion/sync/status").await;
    assert_eq!(counts["documents"]["cave.md"], "scanning");
}

#[tokio::test]
async fn test_webhook_requires_a_valid_signature() {
    let app = App::new();
    let event = json!({ "type": "block.changed", "id": "blk" });

    let (status, _) = app.send(webhook_request(&event, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let forged = sign("not-the-secret", event.to_string().as_bytes()).unwrap();
    let (status, _) = app.send(webhook_request(&event, Some(forged))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, counts) = app.get("/notion/sync/status").await;
    assert_eq!(counts["total"], 0);
}

#[tokio::test]
async fn test_webhook_without_a_secret_accepts_nothing() {
    let app = App::build(AuthConfig::default(), RateLimitConfig::default(), None);
    app.write("cave.md", "Alpha\n");
    app.push("cave.md").await;
    let (_, before) = app.get("/notion/sync/status").await;
    let event = json!({ "type": "block.changed", "id": "blk", "page_id": app.page });

    let (status, body) = app.send(webhook_request(&event, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("no webhook secret"));

    let signed = sign(SECRET, event.to_string().as_bytes()).unwrap();
    let (status, _) = app.send(webhook_request(&event, Some(signed))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, after) = app.get("/notion/sync/status").await;
    assert_eq!(after["pendingCount"], 0);
    assert_eq!(after["total"], before["total"]);

    let (_, about) = app.get("/notion").await;
    assert_eq!(about["webhook_signatures"], false);
}

#[tokio::test]
async fn test_webhook_handshake_and_bad_events() {
    let app = App::new();
    let handshake = json!({ "verification_token": "tok" });
    let sig = sign(SECRET, handshake.to_string().as_bytes()).unwrap();
    let (status, body) = app.send(webhook_request(&handshake, Some(sig))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["handshake"], true);

    let unsupported = json!({ "type": "comment.created", "id": "c" });
    let sig = sign(SECRET, unsupported.to_string().as_bytes()).unwrap();
    let (status, _) = app.send(webhook_request(&unsupported, Some(sig))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_change_is_applied_by_the_consumer() {
    let app = App::new();
    app.write("cave.md", "Alpha\n\nBravo\n");
    app.push("cave.md").await;

    let bravo = app
        .remote
        .page_tree(&app.page)
        .into_iter()
        .find(|b| text_of(b) == "Bravo")
        .and_then(|b| b["id"].as_str().map(str::to_string))
        .unwrap();
    let edited = to_remote(&parse("Bravo, from the remote side").unwrap()[0]).unwrap();
    app.remote.edit_block(&bravo, &edited);

    let event = json!({
        "type": "block.changed",
        "entity": { "id": bravo, "type": "block" },
        "data": { "parent": { "id": app.page } }
    });
    let sig = sign(SECRET, event.to_string().as_bytes()).unwrap();
    let (status, ingested) = app.send(webhook_request(&event, Some(sig))).await;
    assert_eq!(status, StatusCode::OK, "{ingested}");
    assert_eq!(ingested["queued"], 1);
    assert!(!app.read("cave.md").contains("remote side"));

    let sweep = consumer::sweep(&app.executor).await.unwrap();
    assert_eq!(sweep.documents, 1);
    assert_eq!(sweep.applied, 1);
    assert!(app.read("cave.md").contains("Bravo, from the remote side"));

    let (_, counts) = app.get("/notion/sync/status").await;
    assert_eq!(counts["pendingCount"], 0);
}

#[tokio::test]
async fn test_consumer_fails_changes_for_unknown_pages() {
    let app = App::new();
    let event = json!({ "type": "block.created", "id": "stray", "page_id": "nowhere" });
    let sig = sign(SECRET, event.to_string().as_bytes()).unwrap();
    let (_, ingested) = app.send(webhook_request(&event, Some(sig))).await;
    let id = ingested["queue_ids"][0].as_i64().unwrap();

    let sweep = consumer::sweep(&app.executor).await.unwrap();
    assert_eq!(sweep.unrouted, 1);

    let (_, counts) = app.get("/notion/sync/status").await;
    assert_eq!(counts["errorCount"], 1);

    // Failed entries can be put back in line; pending ones cannot.
    let (status, entry) = app.post(&format!("/notion/sync/queue/{id}/retry"), json!({})).await;
    assert_eq!(status, StatusCode::OK, "{entry}");
    assert_eq!(entry["status"], "pending");
    let (status, _) = app.post(&format!("/notion/sync/queue/{id}/retry"), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_retry_refuses_entries_a_newer_change_replaced() {
    let app = App::new();
    let store = app.executor.store();
    let (older, newer) = store
        .transaction(|c| {
            let edit = |text: &str| {
                NewEntry::to_remote("cave.md", &BlockId::from("b1"), ChangeType::Update, json!({ "text": text }))
            };
            let older = queue::enqueue(c, &edit("first draft"), Utc::now())?;
            let newer = queue::enqueue(c, &edit("second draft"), Utc::now())?;
            queue::dequeue_next(c, None)?;
            queue::mark_failed(c, older, "timed out", true)?;
            queue::dequeue_next(c, None)?;
            queue::mark(c, newer, QueueStatus::Success, None, Utc::now())?;
            Ok((older, newer))
        })
        .unwrap();

    let (status, body) = app.post(&format!("/notion/sync/queue/{older}/retry"), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains(&format!("superseded by newer entry {newer}")));
    assert_eq!(store.read(|c| queue::get(c, older)).unwrap().status, QueueStatus::Error);
}

#[tokio::test]
async fn test_retry_and_resolve_unknown_entries() {
    let app = App::new();
    let (status, _) = app.post("/notion/sync/queue/999/retry", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .post("/notion/sync/conflicts/999/resolve", json!({ "choice": "remote" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app
        .post("/notion/sync/conflicts/1/resolve", json!({ "choice": "both" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("both"));
}

#[tokio::test]
async fn test_resolving_a_non_conflict_is_rejected() {
    let app = App::new();
    app.write("cave.md", "Alpha\n");
    app.push("cave.md").await;

    let (status, _) = app
        .post("/notion/sync/conflicts/1/resolve", json!({ "choice": "local" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_clear_completed_entries() {
    let app = App::new();
    app.write("cave.md", "Alpha\n\nBravo\n");
    app.push("cave.md").await;

    let (_, body) = app
        .send(json_request("DELETE", "/notion/sync/queue/completed", &json!({}), None))
        .await;
    assert_eq!(body["removed"], 0);
    assert_eq!(body["keep_days"], 30);

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let (status, body) = app
        .send(json_request(
            "DELETE",
            "/notion/sync/queue/completed?keep_days=0",
            &json!({}),
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 2);
}

#[tokio::test]
async fn test_tokens_scope_capabilities_and_paths() {
    let auth = AuthConfig {
        secret: Some("api-secret".into()),
        expected_aud: None,
        require_auth: true,
    };
    let app = App::with(auth, RateLimitConfig::default());
    app.write("cave.md", "Alpha\n");
    let push = json!({ "page_id": app.page, "local_path": "cave.md" });

    let (status, _) = app
        .send(json_request("POST", "/notion/sync/to-notion", &push, None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let reader = create_token(b"api-secret", "reader", vec![Capability::Read], None, 600).unwrap();
    let (status, _) = app
        .send(json_request("POST", "/notion/sync/to-notion", &push, Some(&reader)))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let scoped = create_token(
        b"api-secret",
        "quests-bot",
        vec![Capability::Sync],
        Some(vec!["quests/**".into()]),
        600,
    )
    .unwrap();
    let (status, _) = app
        .send(json_request("POST", "/notion/sync/to-notion", &push, Some(&scoped)))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let forged = create_token(b"other", "mallory", Capability::all(), None, 600).unwrap();
    let (status, _) = app
        .send(json_request("POST", "/notion/sync/to-notion", &push, Some(&forged)))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let full = create_token(b"api-secret", "ops", Capability::all(), None, 600).unwrap();
    let (status, report) = app
        .send(json_request("POST", "/notion/sync/to-notion", &push, Some(&full)))
        .await;
    assert_eq!(status, StatusCode::OK, "{report}");

    // The webhook is authenticated by its signature alone
    let event = json!({ "verification_token": "tok" });
    let sig = sign(SECRET, event.to_string().as_bytes()).unwrap();
    let (status, _) = app.send(webhook_request(&event, Some(sig))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_sync_triggers_are_rate_limited() {
    let app = App::with(
        AuthConfig::default(),
        RateLimitConfig {
            burst: 1,
            refill_rate: 0.01,
            enabled: true,
        },
    );
    app.write("cave.md", "Alpha\n");

    let (status, _) = app.push("cave.md").await;
    assert_eq!(status, StatusCode::OK);

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/notion/sync/to-notion",
            &json!({ "page_id": app.page, "local_path": "cave.md" }),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));

    // Reads are not limited
    let (status, _) = app.get("/notion/sync/status").await;
    assert_eq!(status, StatusCode::OK);
}
