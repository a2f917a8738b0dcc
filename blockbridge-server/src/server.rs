use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use blockbridge_core::Side;
use blockbridge_store::{mappings, queue, BlockMapping, QueueCounts, Store, SyncQueueEntry};
use blockbridge_sync::{ingest, verify_signature, Executor, IngestReport, NotionClient, SyncPhase, SyncReport};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::{AuthError, AuthState, Capability, MaybeClaims},
    config::ServeConfig,
    consumer,
    error::ApiError,
    ratelimit::{RateLimitConfig, RateLimiter},
};

pub const SIGNATURE_HEADER: &str = "x-notion-signature";

const DEFAULT_QUEUE_LIMIT: usize = 50;
const MAX_QUEUE_LIMIT: usize = 1000;

/// How long an unused rate-limit bucket is kept.
const BUCKET_IDLE: Duration = Duration::from_secs(600);

#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<Executor>,
    pub webhook_secret: Option<Arc<str>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub keep_completed_days: u32,
    wake: mpsc::Sender<()>,
}

impl AppState {
    /// State plus the receiving end of the consumer's wake-up channel.
    pub fn new(
        executor: Arc<Executor>,
        webhook_secret: Option<String>,
        rate_limit: RateLimitConfig,
        keep_completed_days: u32,
    ) -> (Self, mpsc::Receiver<()>) {
        // One slot is enough: a pending wake-up already covers later events.
        let (wake, rx) = mpsc::channel(1);
        let state = Self {
            executor,
            webhook_secret: webhook_secret.map(Arc::from),
            rate_limiter: Arc::new(RateLimiter::new(rate_limit)),
            keep_completed_days,
            wake,
        };
        (state, rx)
    }

    fn store(&self) -> &Store {
        self.executor.store()
    }

    fn wake_consumer(&self) {
        // Full means a sweep is already due.
        let _ = self.wake.try_send(());
    }
}

pub fn router(state: AppState, auth: AuthState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/notion", get(describe))
        // Signed by the remote service, not by API tokens
        .route("/notion/webhook", post(webhook))
        .route("/notion/sync/to-notion", post(sync_to_notion))
        .route("/notion/sync/from-notion", post(sync_from_notion))
        .route("/notion/sync/status", get(status))
        .route("/notion/sync/queue", get(recent_entries))
        .route("/notion/sync/queue/completed", delete(clear_completed))
        .route("/notion/sync/queue/{id}/retry", post(retry_entry))
        .route("/notion/sync/conflicts/{id}/resolve", post(resolve_conflict))
        .route("/notion/maps", get(list_maps))
        .layer(Extension(auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: ServeConfig) -> Result<()> {
    let db_path = config.core.database_path();
    let store = Arc::new(
        Store::open(&db_path).with_context(|| format!("failed to open {}", db_path.display()))?,
    );
    let client = NotionClient::new(
        config.core.remote.api_base.clone(),
        config.core.remote.api_version.clone(),
        config.api_key.clone(),
        Duration::from_secs(config.core.remote.timeout_secs),
    )
    .context("failed to build the remote client")?;
    let executor = Arc::new(Executor::from_config(store, Arc::new(client), &config.core));

    let interrupted = executor.recover()?;
    if interrupted > 0 {
        warn!(interrupted, "marked entries left in flight by the previous run as failed");
    }
    if config.webhook_secret.is_none() {
        warn!("NOTION_WEBHOOK_SECRET is not set; webhook deliveries will be rejected");
    }

    let (state, wake) = AppState::new(
        executor.clone(),
        config.webhook_secret.clone(),
        config.rate_limit.clone(),
        config.core.sync.keep_completed_days,
    );
    tokio::spawn(consumer::run(executor, wake, config.sweep_interval));

    let limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(BUCKET_IDLE);
        loop {
            ticker.tick().await;
            limiter.sweep(BUCKET_IDLE);
        }
    });

    let app = router(state, config.auth.state());

    info!(
        addr = %config.listen_addr,
        vault = %config.core.vault_dir().display(),
        "blockbridge listening"
    );
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn describe(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": "blockbridge",
        "version": env!("CARGO_PKG_VERSION"),
        "webhook_signatures": state.webhook_secret.is_some(),
        "endpoints": [
            "POST /notion/webhook",
            "POST /notion/sync/to-notion",
            "POST /notion/sync/from-notion",
            "GET /notion/sync/status",
            "GET /notion/sync/queue?limit=N",
            "DELETE /notion/sync/queue/completed?keep_days=N",
            "POST /notion/sync/queue/{id}/retry",
            "POST /notion/sync/conflicts/{id}/resolve",
            "GET /notion/maps",
        ],
    }))
}

fn check_rate_limit(state: &AppState, claims: &MaybeClaims) -> Result<(), AuthError> {
    if let Err(retry_after) = state.rate_limiter.check(claims.subject()) {
        return Err(AuthError::RateLimited {
            retry_after_secs: retry_after.as_secs().max(1),
        });
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Webhook
// ─────────────────────────────────────────────────────────────────────────────

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestReport>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(err) = verify_signature(state.webhook_secret.as_deref(), signature, &body) {
        warn!(error = %err, "rejected webhook");
        return Err(err.into());
    }

    let event: Value = serde_json::from_slice(&body).map_err(blockbridge_sync::WebhookError::from)?;
    let report = ingest(state.store(), &event)?;
    if report.queued > 0 {
        state.wake_consumer();
    }
    Ok(Json(report))
}

// ─────────────────────────────────────────────────────────────────────────────
// Sync triggers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ToRemoteRequest {
    page_id: String,
    local_path: String,
}

async fn sync_to_notion(
    State(state): State<AppState>,
    claims: MaybeClaims,
    Json(req): Json<ToRemoteRequest>,
) -> Result<Json<SyncReport>, ApiError> {
    claims.authorize(Capability::Sync, Some(&req.local_path))?;
    check_rate_limit(&state, &claims)?;

    let report = state
        .executor
        .sync_to_remote(&req.local_path, &req.page_id)
        .await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct FromRemoteRequest {
    page_id: String,
    output_path: String,
}

async fn sync_from_notion(
    State(state): State<AppState>,
    claims: MaybeClaims,
    Json(req): Json<FromRemoteRequest>,
) -> Result<Json<SyncReport>, ApiError> {
    claims.authorize(Capability::Sync, Some(&req.output_path))?;
    check_rate_limit(&state, &claims)?;

    let report = state
        .executor
        .sync_from_remote(&req.page_id, &req.output_path)
        .await?;
    Ok(Json(report))
}

// ─────────────────────────────────────────────────────────────────────────────
// Queue inspection and maintenance
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct StatusPayload {
    #[serde(flatten)]
    counts: QueueCounts,
    documents: BTreeMap<String, SyncPhase>,
}

async fn status(
    State(state): State<AppState>,
    claims: MaybeClaims,
) -> Result<Json<StatusPayload>, ApiError> {
    claims.authorize(Capability::Read, None)?;
    let counts = state.store().read(queue::counts)?;
    Ok(Json(StatusPayload {
        counts,
        documents: state.executor.locks().snapshot(),
    }))
}

#[derive(Deserialize)]
struct QueueQuery {
    limit: Option<usize>,
}

async fn recent_entries(
    State(state): State<AppState>,
    claims: MaybeClaims,
    Query(q): Query<QueueQuery>,
) -> Result<Json<Vec<SyncQueueEntry>>, ApiError> {
    claims.authorize(Capability::Read, None)?;
    let limit = q.limit.unwrap_or(DEFAULT_QUEUE_LIMIT).min(MAX_QUEUE_LIMIT);
    let entries = state.store().read(|c| queue::recent(c, limit))?;
    Ok(Json(entries))
}

async fn list_maps(
    State(state): State<AppState>,
    claims: MaybeClaims,
) -> Result<Json<Vec<BlockMapping>>, ApiError> {
    claims.authorize(Capability::Read, None)?;
    let rows = state.store().read(mappings::list)?;
    Ok(Json(rows))
}

async fn retry_entry(
    State(state): State<AppState>,
    claims: MaybeClaims,
    Path(id): Path<i64>,
) -> Result<Json<SyncQueueEntry>, ApiError> {
    let entry = state.store().read(|c| queue::get(c, id))?;
    claims.authorize(Capability::Sync, entry.local_path.as_deref())?;
    check_rate_limit(&state, &claims)?;

    let entry = state.store().transaction(|c| {
        queue::requeue(c, id)?;
        queue::get(c, id)
    })?;
    info!(entry_id = id, "queue entry requeued");
    state.wake_consumer();
    Ok(Json(entry))
}

#[derive(Deserialize)]
struct ResolveRequest {
    choice: String,
    connection_path: Option<String>,
}

async fn resolve_conflict(
    State(state): State<AppState>,
    claims: MaybeClaims,
    Path(id): Path<i64>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<SyncReport>, ApiError> {
    let choice = Side::from_str(&req.choice).ok_or_else(|| {
        ApiError::BadRequest(format!("choice must be `local` or `remote`, got `{}`", req.choice))
    })?;
    let entry = state.store().read(|c| queue::get(c, id))?;
    claims.authorize(Capability::Resolve, entry.local_path.as_deref())?;
    check_rate_limit(&state, &claims)?;

    let report = state
        .executor
        .resolve_conflict(id, choice, req.connection_path)
        .await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct ClearQuery {
    keep_days: Option<u32>,
}

async fn clear_completed(
    State(state): State<AppState>,
    claims: MaybeClaims,
    Query(q): Query<ClearQuery>,
) -> Result<Json<Value>, ApiError> {
    claims.authorize(Capability::Sync, None)?;
    check_rate_limit(&state, &claims)?;

    let keep_days = q.keep_days.unwrap_or(state.keep_completed_days);
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(keep_days));
    let removed = state.store().write(|c| queue::clear_completed(c, cutoff))?;
    Ok(Json(json!({ "removed": removed, "keep_days": keep_days })))
}
