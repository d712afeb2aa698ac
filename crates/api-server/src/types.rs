//! API request and response types

use serde::{Deserialize, Serialize};

use hoopcut_common::{
    DetectionSettings, DetectionStats, FrameDetections, SceneSegment, VideoInfo,
};

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Structured error body
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Upload response: metadata of the stored working video
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub video: VideoInfo,
    pub working_path: String,
}

/// Scene detection request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenesRequest {
    /// Path override; defaults to the cached working video
    #[serde(default)]
    pub video_path: Option<String>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub min_scene_len: Option<u32>,
}

impl ScenesRequest {
    /// Parameter overrides bypass the single cached scene list
    #[must_use]
    pub fn has_overrides(&self) -> bool {
        self.threshold.is_some() || self.min_scene_len.is_some()
    }
}

/// Scene detection response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenesResponse {
    pub scenes: Vec<SceneSegment>,
    pub cached: bool,
    pub elapsed_seconds: f64,
}

/// Ball detection request (batch and streaming variants)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallsRequest {
    /// Path override; defaults to the cached working video
    #[serde(default)]
    pub video_path: Option<String>,
    /// Sampling stride; 0 or absent means auto
    #[serde(default)]
    pub frame_skip: Option<u32>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub max_workers: Option<usize>,
}

/// Ball detection batch response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BallsResponse {
    pub detections: Vec<FrameDetections>,
    pub settings: DetectionSettings,
    pub stats: DetectionStats,
    pub cached: bool,
}

/// Export request: ordered segments to trim and concatenate
#[derive(Debug, Clone, Deserialize)]
pub struct ExportRequest {
    pub segments: Vec<SceneSegment>,
}

/// Export response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResponse {
    pub output_path: String,
    pub elapsed_seconds: f64,
}

/// Cache clear response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheClearResponse {
    pub removed: usize,
}
