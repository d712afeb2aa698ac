//! REST API server for the highlights pipeline
//!
//! Exposes upload, scene detection, ball detection (batch and streaming
//! NDJSON variants), clip export, and cache inspection over HTTP. The
//! framework layer is deliberately thin: routing, CORS and request tracing
//! wrap the pipeline crates, which hold all the behavior.

mod handlers;
mod types;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use hoopcut_cache::{CacheConfig, CacheStore};
use hoopcut_common::Result;
use hoopcut_export::ExportConfig;
use hoopcut_inference::InferenceConfig;
use hoopcut_pipeline::PipelineConfig;

pub use handlers::*;
pub use types::*;

/// Largest accepted upload body
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Full server configuration, assembled once at startup and passed
/// explicitly — no process-global mutable state
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub inference: InferenceConfig,
    pub pipeline: PipelineConfig,
    pub cache: CacheConfig,
    pub export: ExportConfig,
}

impl ServerConfig {
    /// Read configuration from `HOOPCUT_*` environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let mut inference = InferenceConfig::default();
        if let Ok(endpoint) = std::env::var("HOOPCUT_INFERENCE_URL") {
            inference.endpoint = endpoint;
        }
        inference.api_key = std::env::var("HOOPCUT_API_KEY").unwrap_or_default();
        inference.confidence_threshold =
            env_parse("HOOPCUT_CONFIDENCE", inference.confidence_threshold);
        inference.infer_max_width =
            env_parse("HOOPCUT_INFER_MAX_WIDTH", inference.infer_max_width);

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            frame_skip: env_parse("HOOPCUT_FRAME_SKIP", defaults.frame_skip),
            target_samples: env_parse("HOOPCUT_TARGET_SAMPLES", defaults.target_samples),
            max_workers: env_parse("HOOPCUT_MAX_WORKERS", defaults.max_workers),
            ..defaults
        };

        Self {
            addr: std::env::var("HOOPCUT_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            inference,
            pipeline,
            cache: CacheConfig::from_env(),
            export: ExportConfig::from_env(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: CacheStore,
}

impl AppState {
    /// Create server state, initializing the cache directory
    ///
    /// # Errors
    ///
    /// Returns `ClipError::CacheIo` when the cache directory cannot be
    /// created.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store = CacheStore::new(config.cache.clone())?;
        Ok(Self {
            config: Arc::new(config),
            store,
        })
    }
}

/// Build the API router with all endpoints
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/upload", post(upload_video))
        .route("/api/v1/scenes", post(detect_scenes_handler))
        .route("/api/v1/balls", post(detect_balls))
        .route("/api/v1/balls/stream", post(detect_balls_stream))
        .route("/api/v1/export", post(export_clip))
        .route("/api/v1/cache", get(cache_status).delete(cache_clear))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the API server
///
/// # Errors
///
/// Returns the bind or serve error.
pub async fn start_server(state: AppState) -> std::io::Result<()> {
    let addr = state.config.addr.clone();
    tracing::info!("Starting highlights API server on {addr}");

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await
}
