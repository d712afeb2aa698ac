/// Common types and error taxonomy for the highlights pipeline
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum ClipError {
    #[error("failed to open video source: {0}")]
    Open(String),

    #[error("no video stream found")]
    NoVideoStream,

    #[error("inference request failed: {0}")]
    Inference(String),

    #[error("scene detection failed: {0}")]
    Scene(String),

    #[error("export failed: {0}")]
    Export(String),

    #[error("cache I/O error: {0}")]
    CacheIo(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, ClipError>;

/// A single detected ball, in original-frame pixel coordinates
///
/// `x,y` is the top-left corner, converted from the center-point form the
/// detection backend reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub confidence: f32,
    pub class: String,
}

/// Detections for one sampled frame
///
/// `frame` is the original un-skipped frame index in the source video, so
/// consumers can correlate back to exact timestamps. `time = frame / fps`
/// (0 when fps is unknown).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDetections {
    pub time: f64,
    pub frame: u64,
    pub boxes: Vec<DetectionBox>,
}

/// A contiguous time range treated as one visual shot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneSegment {
    pub start: f64,
    pub end: f64,
}

impl SceneSegment {
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Sampling configuration snapshot, computed once per detection run and
/// echoed back to the caller for reproducibility
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionSettings {
    pub requested_frame_skip: u32,
    pub effective_frame_skip: u32,
    pub target_samples: u32,
    pub confidence_threshold: f32,
    pub max_workers: u32,
    pub infer_max_width: u32,
}

/// Aggregate statistics for one detection run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStats {
    pub processed_frames: u64,
    pub failed_frames: u64,
    pub total_frames: i64,
    pub frames_with_boxes: u64,
    pub total_boxes: u64,
    pub elapsed_seconds: f64,
}

/// The persisted form of a completed detection run
///
/// Settings are stored alongside the records so a later request can decide
/// whether the cached sequence is reusable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionDocument {
    pub settings: DetectionSettings,
    pub stats: DetectionStats,
    pub detections: Vec<FrameDetections>,
}

/// Container-level metadata for a video file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Total frame count, 0 when the container does not report one
    pub total_frames: i64,
    pub duration: f64,
    pub has_audio: bool,
}

impl VideoInfo {
    /// Timestamp in seconds for an original frame index
    #[must_use]
    pub fn timestamp(&self, frame: u64) -> f64 {
        if self.fps > 0.0 {
            frame as f64 / self.fps
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_serialize_camel_case() {
        let settings = DetectionSettings {
            requested_frame_skip: 0,
            effective_frame_skip: 20,
            target_samples: 450,
            confidence_threshold: 0.3,
            max_workers: 8,
            infer_max_width: 640,
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"requestedFrameSkip\":0"));
        assert!(json.contains("\"effectiveFrameSkip\":20"));
        assert!(json.contains("\"inferMaxWidth\":640"));
    }

    #[test]
    fn test_frame_detections_roundtrip() {
        let record = FrameDetections {
            time: 1.5,
            frame: 45,
            boxes: vec![DetectionBox {
                x: 80,
                y: 20,
                w: 40,
                h: 60,
                confidence: 0.8,
                class: "Basketball".to_string(),
            }],
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: FrameDetections = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_timestamp_zero_fps() {
        let info = VideoInfo {
            width: 1280,
            height: 720,
            fps: 0.0,
            total_frames: 0,
            duration: 0.0,
            has_audio: false,
        };
        assert_eq!(info.timestamp(300), 0.0);

        let info = VideoInfo { fps: 30.0, ..info };
        assert!((info.timestamp(90) - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_segment_duration() {
        let segment = SceneSegment { start: 2.5, end: 7.0 };
        assert!((segment.duration() - 4.5).abs() < f64::EPSILON);
    }
}
