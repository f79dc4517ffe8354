//! HTTP surface for operators.
//!
//! Exposes the two pipeline operations plus a health check:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/tenants/{tenant}/ingest` | Full-site bulk ingest, JSON summary |
//! | `POST` | `/tenants/{tenant}/sync` | Incremental sync, SSE progress stream |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! The sync endpoint streams `start` / `progress` / `complete` server-sent
//! events; a client disconnect closes the channel and cancels the run
//! cooperatively between batches.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "tenant id must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `rate_limited` (429), `timeout` (408),
//! `ingest_failed` (500).
//!
//! Both mutation routes are rate limited per caller, keyed by the
//! `x-caller-id` header (`"anonymous"` when absent).

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use crate::bulk;
use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::fetch::CrawlClient;
use crate::migrate;
use crate::models::BulkSummary;
use crate::rate_limit::RateLimiter;
use crate::store::ChunkStore;
use crate::sync::{self, SyncOptions, SyncRunner};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    runner: SyncRunner,
    limiter: Arc<RateLimiter>,
}

/// Starts the HTTP server. Binds to `[server].bind`, runs migrations, and
/// serves until the process is terminated.
pub async fn run_server(config: &Config) -> Result<()> {
    let pool = db::connect(&config.db.path).await?;
    migrate::run_migrations(&pool).await?;

    let fetcher = Arc::new(CrawlClient::new(&config.crawler)?);
    let embedder = embedding::create_embedder(&config.embedding)?;
    let store = ChunkStore::new(pool, config.sync.insert_batch_size);
    let runner = SyncRunner::new(fetcher, embedder, store, SyncOptions::from_config(config));

    let state = AppState {
        config: Arc::new(config.clone()),
        runner,
        limiter: Arc::new(RateLimiter::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/tenants/{tenant}/ingest", post(handle_bulk_ingest))
        .route("/tenants/{tenant}/sync", post(handle_sync))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    let bind_addr = &config.server.bind;
    tracing::info!(bind = %bind_addr, "kb-sync server listening");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn rate_limited(retry_after_ms: u64) -> AppError {
    AppError {
        status: StatusCode::TOO_MANY_REQUESTS,
        code: "rate_limited".to_string(),
        message: format!("rate limit exceeded, retry in {}ms", retry_after_ms),
    }
}

fn timeout_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::REQUEST_TIMEOUT,
        code: "timeout".to_string(),
        message: message.into(),
    }
}

fn ingest_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "ingest_failed".to_string(),
        message: message.into(),
    }
}

/// Map pipeline errors to the closest HTTP status: validation problems are
/// the caller's fault, everything else is an ingest failure.
fn classify_ingest_error(err: anyhow::Error) -> AppError {
    let msg = format!("{err:#}");
    if msg.contains("must not be empty") || msg.contains("malformed") {
        bad_request(msg)
    } else if msg.contains("wall-clock budget") {
        timeout_error(msg)
    } else {
        ingest_error(msg)
    }
}

/// Rate-limit gate shared by both mutation routes.
fn check_rate_limit(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let caller = headers
        .get("x-caller-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous");
    let identity = format!("ingest:{}", caller);

    let decision = state.limiter.check(&identity, &state.config.rate_limit);
    if decision.allowed {
        Ok(())
    } else {
        Err(rate_limited(decision.retry_after_ms))
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /tenants/{tenant}/ingest ============

#[derive(Deserialize)]
struct IngestRequest {
    seed_url: String,
}

/// Full-site bulk ingest. Returns the final summary, or an error if the
/// crawl fails, every page is empty, or the wall-clock budget runs out.
/// The budget is enforced inside the pipeline (between batches, never
/// during the corpus swap) and surfaces here as a timeout error.
async fn handle_bulk_ingest(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Json(req): Json<IngestRequest>,
) -> Result<Json<BulkSummary>, AppError> {
    check_rate_limit(&state, &headers)?;

    let runner = state.runner.clone();
    let options = SyncOptions::from_config(&state.config);

    bulk::run_bulk_ingest(
        runner.fetcher(),
        runner.embedder(),
        runner.store(),
        &options,
        &tenant,
        &req.seed_url,
    )
    .await
    .map(Json)
    .map_err(classify_ingest_error)
}

// ============ POST /tenants/{tenant}/sync ============

#[derive(Deserialize)]
struct SyncRequest {
    urls: Vec<String>,
}

/// Incremental sync as an SSE stream. Validation failures are rejected
/// up front with a JSON error; after that the response is a live event
/// stream ending with a `complete` event.
async fn handle_sync(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SyncRequest>,
) -> Result<impl IntoResponse, AppError> {
    check_rate_limit(&state, &headers)?;
    sync::validate_request(&tenant, &req.urls).map_err(|e| bad_request(format!("{e:#}")))?;

    let (tx, rx) = mpsc::channel(64);
    let runner = state.runner.clone();

    tokio::spawn(async move {
        if let Err(e) = runner.run(&tenant, req.urls, tx).await {
            tracing::warn!(tenant, error = %format!("{e:#}"), "sync run failed");
        }
    });

    let stream = ReceiverStream::new(rx)
        .map(|event| Event::default().event(event.name()).json_data(&event));

    Ok(Sse::new(stream))
}
