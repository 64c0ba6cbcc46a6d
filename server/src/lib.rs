pub mod config;
pub mod error;
pub mod validation;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use audio_cache::{OptimizeOptions, OptimizeReport, SynthesisGateway, SynthesisRequest};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::validation::validate_tts_request;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<SynthesisGateway>,
    pub request_count: Arc<AtomicU64>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(gateway: Arc<SynthesisGateway>, config: ServerConfig) -> Self {
        Self {
            gateway,
            request_count: Arc::new(AtomicU64::new(0)),
            config,
        }
    }
}

static START_TIME: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

/// Record process start for uptime reporting. Idempotent.
pub fn init_start_time() {
    let _ = START_TIME.get_or_init(std::time::Instant::now);
}

/// All API routes, mounted both at the root and under `/api` so clients
/// can use either prefix. Middleware is layered on top by the caller.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(health_check))
        .route("/tts", post(tts_endpoint))
        .route("/tts/cache/status", get(cache_status_endpoint))
        .route("/tts/cache/analytics", get(cache_analytics_endpoint))
        .route("/tts/cache/optimize", post(cache_optimize_endpoint))
        .route("/tts/cache/manage", post(cache_manage_endpoint))
        .route("/system/status", get(system_status_endpoint));

    Router::new()
        .merge(api.clone()) // root paths
        .nest("/api", api) // /api prefix
        .with_state(state)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsRequest {
    text: String,
    #[serde(default = "default_voice")]
    voice: String,
    instruction_id: Option<String>,
    #[serde(default = "default_provider")]
    provider: String,
    #[serde(default)]
    is_starting_instruction: bool,
}

fn default_voice() -> String {
    "alloy".to_string()
}

fn default_provider() -> String {
    "openai".to_string()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatusResponse {
    files: u64,
    size_bytes: u64,
    #[serde(rename = "sizeMB")]
    size_mb: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeRequest {
    /// Size budget in megabytes.
    max_size: Option<u64>,
    /// Age budget in days.
    max_age: Option<f64>,
    keep_high_priority: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManageRequest {
    action: String,
    #[serde(default)]
    clear_all: bool,
    instruction_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManageResponse {
    deleted_files: u64,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatusResponse {
    memory_used_mb: u64,
    memory_total_mb: u64,
    memory_usage_percent: f32,
    request_count: u64,
    uptime_seconds: u64,
    cache: CacheStatusResponse,
}

pub async fn health_check() -> &'static str {
    "ok"
}

/// Cache-first synthesis: returns the mp3 bytes for the requested text,
/// generating them upstream only on a cache miss.
pub async fn tts_endpoint(
    State(state): State<AppState>,
    Json(req): Json<TtsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    validate_tts_request(&req.text, &req.provider)?;

    let mut synth = SynthesisRequest::new(&req.text, &req.voice, &req.provider)
        .starting(req.is_starting_instruction);
    synth.owner_id = req.instruction_id;

    let audio = state.gateway.get_or_synthesize(&synth).await?;

    Ok(([(header::CONTENT_TYPE, "audio/mpeg")], audio))
}

pub async fn cache_status_endpoint(
    State(state): State<AppState>,
) -> Result<Json<CacheStatusResponse>, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let status = state.gateway.status().await?;
    Ok(Json(cache_status_body(
        status.file_count,
        status.total_size_bytes,
    )))
}

pub async fn cache_analytics_endpoint(
    State(state): State<AppState>,
) -> Json<audio_cache::LedgerAnalytics> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    Json(state.gateway.analytics())
}

pub async fn cache_optimize_endpoint(
    State(state): State<AppState>,
    Json(req): Json<OptimizeRequest>,
) -> Result<Json<OptimizeReport>, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let report = state
        .gateway
        .optimize(OptimizeOptions {
            max_size_mb: req.max_size,
            max_age_days: req.max_age,
            keep_high_priority: req.keep_high_priority.unwrap_or(true),
        })
        .await?;
    Ok(Json(report))
}

pub async fn cache_manage_endpoint(
    State(state): State<AppState>,
    Json(req): Json<ManageRequest>,
) -> Result<Json<ManageResponse>, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    if req.action != "clear" {
        return Err(ApiError::InvalidInput(format!(
            "Unknown action: {}. Expected: clear",
            req.action
        )));
    }

    if req.clear_all {
        let deleted = state.gateway.clear_all().await?;
        return Ok(Json(ManageResponse {
            deleted_files: deleted,
            message: "Cache cleared".to_string(),
        }));
    }

    let Some(instruction_id) = req.instruction_id else {
        return Err(ApiError::InvalidInput(
            "Either clearAll or instructionId is required".to_string(),
        ));
    };
    let deleted = state.gateway.invalidate_owner(&instruction_id).await?;
    Ok(Json(ManageResponse {
        deleted_files: deleted,
        message: format!("Cache cleared for instruction {instruction_id}"),
    }))
}

pub async fn system_status_endpoint(
    State(state): State<AppState>,
) -> Result<Json<SystemStatusResponse>, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);

    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);

    let status = state.gateway.status().await?;

    Ok(Json(SystemStatusResponse {
        memory_used_mb: memory_used / 1024 / 1024,
        memory_total_mb: memory_total / 1024 / 1024,
        memory_usage_percent,
        request_count: state.request_count.load(Ordering::Relaxed),
        uptime_seconds: uptime,
        cache: cache_status_body(status.file_count, status.total_size_bytes),
    }))
}

fn cache_status_body(files: u64, size_bytes: u64) -> CacheStatusResponse {
    let size_mb = (size_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;
    CacheStatusResponse {
        files,
        size_bytes,
        size_mb,
    }
}
