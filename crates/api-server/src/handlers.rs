//! HTTP request handlers

use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use hoopcut_common::{ClipError, DetectionSettings};
use hoopcut_inference::InferenceConfig;
use hoopcut_pipeline::{run_detection, DetectionEvent, PipelineConfig};
use hoopcut_scene::{detect_scenes, SceneDetectorConfig};
use hoopcut_video_source::probe;

use crate::types::{
    BallsRequest, BallsResponse, CacheClearResponse, ErrorResponse, ExportRequest,
    ExportResponse, HealthResponse, ScenesRequest, ScenesResponse, UploadResponse,
};
use crate::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn clip_error(err: &ClipError) -> ApiError {
    let status = match err {
        ClipError::Open(_) | ClipError::NoVideoStream => StatusCode::UNPROCESSABLE_ENTITY,
        ClipError::Inference(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.to_string())
}

/// Resolve the video a request targets: an explicit path override, else the
/// cached working video
fn resolve_video(state: &AppState, requested: Option<&str>) -> Result<PathBuf, ApiError> {
    let path = match requested {
        Some(path) => PathBuf::from(path),
        None => state.store.working_video(),
    };
    if !path.exists() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("video not found: {}", path.display()),
        ));
    }
    Ok(path)
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "hoopcut".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Receive a video upload, remux it into the working MP4, and probe it
pub async fn upload_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let original = state.store.original_video();
    let mut received = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("bad multipart body: {e}")))?
    {
        let is_video = matches!(field.name(), Some("video")) || field.file_name().is_some();
        if !is_video || received {
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("upload failed: {e}")))?;
        if bytes.is_empty() {
            continue;
        }
        info!("Received upload of {} bytes", bytes.len());
        tokio::fs::write(&original, &bytes).await.map_err(|e| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to store upload: {e}"),
            )
        })?;
        received = true;
    }

    if !received {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "no video field in upload",
        ));
    }

    let working = state.store.working_video();
    hoopcut_export::remux_to_mp4(&original, &working, &state.config.export)
        .await
        .map_err(|e| clip_error(&e))?;

    // Derived results belong to the previous video.
    state.store.invalidate_results().await;

    let probe_path = working.clone();
    let video = tokio::task::spawn_blocking(move || probe(&probe_path))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| clip_error(&e))?;

    info!(
        "Upload ready: {}x{}, {:.1} fps, {:.1}s",
        video.width, video.height, video.fps, video.duration
    );
    Ok(Json(UploadResponse {
        video,
        working_path: working.display().to_string(),
    }))
}

/// Detect scene segments, serving the cached list when possible
pub async fn detect_scenes_handler(
    State(state): State<AppState>,
    Json(request): Json<ScenesRequest>,
) -> Result<Json<ScenesResponse>, ApiError> {
    let started = Instant::now();
    let video = resolve_video(&state, request.video_path.as_deref())?;

    // Parameter overrides and explicit paths bypass the single cached list.
    let use_cache = request.video_path.is_none() && !request.has_overrides();
    if use_cache {
        if let Some(scenes) = state.store.load_scenes().await {
            info!("Serving {} scenes from cache", scenes.len());
            return Ok(Json(ScenesResponse {
                scenes,
                cached: true,
                elapsed_seconds: started.elapsed().as_secs_f64(),
            }));
        }
    }

    let mut config = SceneDetectorConfig::default();
    if let Some(threshold) = request.threshold {
        config.threshold = threshold;
    }
    if let Some(min_scene_len) = request.min_scene_len {
        config.min_scene_len = min_scene_len;
    }

    let scenes = tokio::task::spawn_blocking(move || detect_scenes(&video, &config))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| clip_error(&e.into()))?;

    if use_cache {
        if let Err(e) = state.store.store_scenes(&scenes).await {
            warn!("failed to cache scenes: {e}");
        }
    }

    Ok(Json(ScenesResponse {
        scenes,
        cached: false,
        elapsed_seconds: started.elapsed().as_secs_f64(),
    }))
}

/// Effective inference configuration for one request
fn effective_inference(state: &AppState, request: &BallsRequest) -> InferenceConfig {
    let mut inference = state.config.inference.clone();
    if let Some(confidence) = request.confidence {
        inference.confidence_threshold = confidence;
    }
    inference
}

/// Effective pipeline configuration for one request
fn effective_pipeline(state: &AppState, request: &BallsRequest) -> PipelineConfig {
    let mut pipeline = state.config.pipeline.clone();
    if let Some(frame_skip) = request.frame_skip {
        pipeline.frame_skip = frame_skip;
    }
    if let Some(max_workers) = request.max_workers {
        pipeline.max_workers = max_workers.max(1);
    }
    pipeline
}

/// A cached document is reusable when the request-level knobs are
/// unchanged. Worker count does not change the result set, so it is
/// excluded deliberately.
fn settings_match(
    cached: &DetectionSettings,
    pipeline: &PipelineConfig,
    inference: &InferenceConfig,
) -> bool {
    cached.requested_frame_skip == pipeline.frame_skip
        && cached.target_samples == pipeline.target_samples
        && cached.confidence_threshold == inference.confidence_threshold
        && cached.infer_max_width == inference.infer_max_width
}

/// Ball detection, batch variant
pub async fn detect_balls(
    State(state): State<AppState>,
    Json(request): Json<BallsRequest>,
) -> Result<Json<BallsResponse>, ApiError> {
    let video = resolve_video(&state, request.video_path.as_deref())?;
    let pipeline = effective_pipeline(&state, &request);
    let inference = Arc::new(effective_inference(&state, &request));

    // The cache holds results for the working video only.
    let targets_working_video = request.video_path.is_none();
    if targets_working_video {
        if let Some(doc) = state.store.load_detections().await {
            if settings_match(&doc.settings, &pipeline, &inference) {
                info!(
                    "Serving {} detection records from cache",
                    doc.detections.len()
                );
                return Ok(Json(BallsResponse {
                    detections: doc.detections,
                    settings: doc.settings,
                    stats: doc.stats,
                    cached: true,
                }));
            }
        }
    }

    let cache = targets_working_video.then(|| state.store.clone());
    let doc = run_detection(video, inference, pipeline, None, cache)
        .await
        .map_err(|e| clip_error(&e))?;

    Ok(Json(BallsResponse {
        detections: doc.detections,
        settings: doc.settings,
        stats: doc.stats,
        cached: false,
    }))
}

/// Ball detection, streaming variant: newline-delimited JSON
///
/// Lines are emitted in completion order; consumers needing frame order
/// buffer and sort, or wait for the `done` line. The run continues to
/// completion even if the client disconnects.
pub async fn detect_balls_stream(
    State(state): State<AppState>,
    Json(request): Json<BallsRequest>,
) -> Result<Response, ApiError> {
    let video = resolve_video(&state, request.video_path.as_deref())?;
    let pipeline = effective_pipeline(&state, &request);
    let inference = Arc::new(effective_inference(&state, &request));

    let (tx, rx) = mpsc::channel::<DetectionEvent>(64);

    let targets_working_video = request.video_path.is_none();
    let cached_doc = if targets_working_video {
        state
            .store
            .load_detections()
            .await
            .filter(|doc| settings_match(&doc.settings, &pipeline, &inference))
    } else {
        None
    };

    if let Some(doc) = cached_doc {
        info!("Streaming {} cached detection records", doc.detections.len());
        tokio::spawn(async move {
            tx.send(DetectionEvent::Meta {
                settings: doc.settings.clone(),
                video: None,
            })
            .await
            .ok();
            for record in doc.detections {
                if tx
                    .send(DetectionEvent::Detection { record })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            tx.send(DetectionEvent::Done {
                stats: doc.stats,
                cached: true,
            })
            .await
            .ok();
        });
    } else {
        let cache = targets_working_video.then(|| state.store.clone());
        tokio::spawn(async move {
            if let Err(e) = run_detection(video, inference, pipeline, Some(tx.clone()), cache).await
            {
                error!("streaming detection run failed: {e}");
                tx.send(DetectionEvent::Error {
                    message: e.to_string(),
                })
                .await
                .ok();
            }
        });
    }

    let lines = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event_line(&event)));
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

fn event_line(event: &DetectionEvent) -> String {
    match serde_json::to_string(event) {
        Ok(mut line) => {
            line.push('\n');
            line
        }
        Err(e) => format!("{{\"type\":\"error\",\"message\":\"{e}\"}}\n"),
    }
}

/// Trim and concatenate selected segments from the working video
pub async fn export_clip(
    State(state): State<AppState>,
    Json(request): Json<ExportRequest>,
) -> Result<Json<ExportResponse>, ApiError> {
    let started = Instant::now();
    let input = resolve_video(&state, None)?;
    let output = state.store.export_output();

    let probe_path = input.clone();
    let video = tokio::task::spawn_blocking(move || probe(&probe_path))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| clip_error(&e))?;

    hoopcut_export::export_segments(
        &input,
        &output,
        &request.segments,
        video.has_audio,
        &state.config.export,
    )
    .await
    .map_err(|e| clip_error(&e))?;

    info!(
        "Exported {} segments in {:.2}s",
        request.segments.len(),
        started.elapsed().as_secs_f64()
    );
    Ok(Json(ExportResponse {
        output_path: output.display().to_string(),
        elapsed_seconds: started.elapsed().as_secs_f64(),
    }))
}

/// List cache entries
pub async fn cache_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.status().await)
}

/// Remove all cache entries
pub async fn cache_clear(
    State(state): State<AppState>,
) -> Result<Json<CacheClearResponse>, ApiError> {
    let removed = state.store.clear().await.map_err(|e| clip_error(&e))?;
    info!("Cleared {removed} cache entries");
    Ok(Json(CacheClearResponse { removed }))
}
