//! Axum HTTP surface for PRMS: upload, search, aggregation, scheduling,
//! listings and health.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use prms_core::{Agent, IngestStats, PolicyView, ScheduledMessage, User, UserSummary};
use prms_ingest::{IngestGate, IngestPipeline};
use prms_scheduler::{schedule_message, MessageSweeper, ScheduleError};
use prms_storage::{MemStore, PgStore, PolicyStore, StoreError};

pub const CRATE_NAME: &str = "prms-web";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub uploads_dir: PathBuf,
    pub assets_dir: PathBuf,
    pub sweep_interval_secs: u64,
    pub max_concurrent_ingests: usize,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PRMS_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            database_url: std::env::var("DATABASE_URL").ok(),
            uploads_dir: std::env::var("UPLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./uploads")),
            assets_dir: std::env::var("PRMS_ASSETS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./assets")),
            sweep_interval_secs: std::env::var("PRMS_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            max_concurrent_ingests: std::env::var("PRMS_MAX_CONCURRENT_INGESTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PolicyStore>,
    pub gate: IngestGate,
    pub uploads_dir: PathBuf,
    pub assets_dir: PathBuf,
    pub started_at: Instant,
}

// ── Error mapping ────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    TooBusy(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::TooBusy(message) => (StatusCode::TOO_MANY_REQUESTS, message),
            ApiError::Internal(err) => {
                error!(error = ?err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Something went wrong".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity } => ApiError::NotFound(format!("{entity} not found")),
            StoreError::Duplicate { .. } | StoreError::Invalid(_) => {
                ApiError::BadRequest(err.to_string())
            }
            other => ApiError::Internal(other.into()),
        }
    }
}

// ── Router ───────────────────────────────────────────────────────────────

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/upload", post(upload_handler))
        .route("/api/policies/search/{username}", get(search_handler))
        .route("/api/policies/aggregated", get(aggregated_handler))
        .route("/api/schedule-message", post(schedule_handler))
        .route("/api/agents", get(agents_handler))
        .route("/api/users", get(users_handler))
        .route("/api/policies", get(policies_handler))
        .route("/api/health", get(health_handler))
        .layer(DefaultBodyLimit::max(16 * 1024 * 1024))
        .with_state(Arc::new(state))
}

const INDEX_FALLBACK: &str = "<!doctype html><html><head><title>PRMS</title></head>\
<body><h1>Policy Records Management Service</h1>\
<p>POST a CSV or XLSX file to <code>/api/upload</code>.</p></body></html>";

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let index_path = state.assets_dir.join("static/index.html");
    match tokio::fs::read_to_string(&index_path).await {
        Ok(page) => Html(page).into_response(),
        Err(_) => Html(INDEX_FALLBACK.to_string()).into_response(),
    }
}

// ── Upload ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    pub data: String,
    pub stats: IngestStats,
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "upload.bin".to_string()
    } else {
        cleaned
    }
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let permit = state.gate.try_begin().ok_or_else(|| {
        ApiError::TooBusy("too many concurrent ingestions; retry shortly".to_string())
    })?;

    let mut saved = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let original_name = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| "upload.bin".to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::BadRequest(err.to_string()))?;

        tokio::fs::create_dir_all(&state.uploads_dir)
            .await
            .map_err(|err| ApiError::Internal(err.into()))?;
        let stored_name = format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            sanitize_file_name(&original_name)
        );
        let path = state.uploads_dir.join(stored_name);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|err| ApiError::Internal(err.into()))?;
        saved = Some((path, original_name));
        break;
    }

    let (path, original_name) =
        saved.ok_or_else(|| ApiError::BadRequest("No file uploaded".to_string()))?;

    // The ingest runs in its own task so a worker panic is isolated from the
    // connection, and parsing inside it runs on the blocking pool.
    let pipeline = IngestPipeline::new(Arc::clone(&state.store));
    let name = original_name.clone();
    let result = tokio::spawn(async move { pipeline.ingest_file(path, &name).await })
        .await
        .map_err(|err| ApiError::Internal(anyhow::anyhow!("ingestion worker died: {err}")))?;
    drop(permit);

    match result {
        Ok(report) => Ok(Json(UploadResponse {
            message: "File processed successfully".to_string(),
            data: format!("Processed {} rows", report.rows_processed),
            stats: report.stats,
        })),
        Err(err) if err.is_rejection() => Err(ApiError::BadRequest(err.to_string())),
        Err(err) => Err(ApiError::Internal(err.into())),
    }
}

// ── Queries ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub user: UserSummary,
    pub policies: Vec<PolicyView>,
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(username): AxumPath<String>,
) -> Result<Json<SearchResponse>, ApiError> {
    let user = state
        .store
        .find_user_by_name_fragment(&username)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    let policies = state.store.policies_for_user(user.id).await?;
    Ok(Json(SearchResponse {
        user: UserSummary::from_user(&user),
        policies,
    }))
}

async fn aggregated_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<prms_core::UserPolicySummary>>, ApiError> {
    let policies = state.store.list_policies().await?;
    Ok(Json(prms_core::aggregate_policies(&policies)))
}

async fn agents_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Agent>>, ApiError> {
    Ok(Json(state.store.list_agents().await?))
}

async fn users_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<User>>, ApiError> {
    Ok(Json(state.store.list_users().await?))
}

async fn policies_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PolicyView>>, ApiError> {
    Ok(Json(state.store.list_policies().await?))
}

// ── Scheduling ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    message: Option<String>,
    day: Option<String>,
    time: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResponse {
    pub message: String,
    pub scheduled_message: ScheduledMessage,
}

async fn schedule_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ScheduleRequest>,
) -> Result<Json<ScheduleResponse>, ApiError> {
    let (message, day, time) = match (request.message, request.day, request.time) {
        (Some(message), Some(day), Some(time))
            if !message.trim().is_empty() && !day.trim().is_empty() && !time.trim().is_empty() =>
        {
            (message, day, time)
        }
        _ => {
            return Err(ApiError::BadRequest(
                "Message, day, and time are required".to_string(),
            ))
        }
    };

    let record = schedule_message(state.store.as_ref(), &message, &day, &time)
        .await
        .map_err(|err| match err {
            ScheduleError::Store(store_err) => ApiError::from(store_err),
            rejection => ApiError::BadRequest(rejection.to_string()),
        })?;

    Ok(Json(ScheduleResponse {
        message: "Message scheduled successfully".to_string(),
        scheduled_message: record,
    }))
}

// ── Health ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub uptime: f64,
    pub ingests_in_flight: usize,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now().to_rfc3339(),
        uptime: state.started_at.elapsed().as_secs_f64(),
        ingests_in_flight: state.gate.in_flight(),
    })
}

// ── Serve ────────────────────────────────────────────────────────────────

pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let store: Arc<dyn PolicyStore> = match &config.database_url {
        Some(url) => {
            let pg = PgStore::connect(url).await.context("connecting to database")?;
            pg.migrate().await.context("running migrations")?;
            Arc::new(pg)
        }
        None => {
            warn!("DATABASE_URL not set; falling back to the in-memory store");
            Arc::new(MemStore::new())
        }
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let sweeper = MessageSweeper::new(
        Arc::clone(&store),
        Duration::from_secs(config.sweep_interval_secs.max(1)),
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx));

    let state = AppState {
        store,
        gate: IngestGate::new(config.max_concurrent_ingests),
        uploads_dir: config.uploads_dir.clone(),
        assets_dir: config.assets_dir.clone(),
        started_at: Instant::now(),
    };

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "server listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(());
    let _ = sweeper_handle.await;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(ServerConfig::from_env()).await
}
