//! Scene segmentation via `FFmpeg`'s scdet filter
//!
//! Scene-cut detection is delegated to `FFmpeg`'s built-in content-difference
//! detector (`scdet`), run as an external process. This crate drives the
//! subprocess, parses boundary timestamps and container metadata from its
//! stderr, and converts the boundaries into ordered `[start, end)` segments.
//!
//! If no cuts are found the whole video is reported as a single segment
//! spanning its duration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};

use hoopcut_common::{ClipError, SceneSegment};

/// Errors specific to scene segmentation
#[derive(Error, Debug)]
pub enum SceneError {
    #[error("ffmpeg execution failed: {0}")]
    Ffmpeg(String),

    #[error("video file not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SceneError> for ClipError {
    fn from(err: SceneError) -> Self {
        ClipError::Scene(err.to_string())
    }
}

/// Configuration for scene segmentation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneDetectorConfig {
    /// Content-difference threshold (0.0-100.0). Higher values detect fewer,
    /// harder cuts.
    pub threshold: f64,

    /// Minimum scene length in frames. Boundaries closer than this to their
    /// predecessor are suppressed.
    pub min_scene_len: u32,

    /// Downscale divisor applied before detection (1 = full resolution).
    pub downscale: u32,
}

impl Default for SceneDetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 70.0,
            min_scene_len: 15,
            downscale: 4,
        }
    }
}

/// Detect scene segments in a video file
///
/// Runs `ffmpeg -vf scdet` as a subprocess and converts the detected
/// boundaries into ordered segments covering `[0, duration)`.
///
/// # Errors
///
/// Returns an error if the file does not exist or ffmpeg cannot be
/// executed. Parse misses on individual stderr lines are logged and
/// skipped, not fatal.
pub fn detect_scenes(
    video_path: &Path,
    config: &SceneDetectorConfig,
) -> Result<Vec<SceneSegment>, SceneError> {
    if !video_path.exists() {
        return Err(SceneError::FileNotFound(video_path.display().to_string()));
    }

    info!(
        "Running scene detection on {} (threshold {}, min scene len {}, downscale {})",
        video_path.display(),
        config.threshold,
        config.min_scene_len,
        config.downscale
    );

    // scdet reports per-boundary score/time lines on stderr:
    // [scdet @ 0x...] lavfi.scd.score: X.XXX, lavfi.scd.time: Y.YYY
    let filter = if config.downscale > 1 {
        format!(
            "scale=iw/{}:-2,scdet=t={}:s=1",
            config.downscale,
            config.threshold / 100.0
        )
    } else {
        format!("scdet=t={}:s=1", config.threshold / 100.0)
    };

    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(video_path)
        .arg("-vf")
        .arg(filter)
        .arg("-an")
        .arg("-f")
        .arg("null")
        .arg("-")
        .output()
        .map_err(|e| SceneError::Ffmpeg(format!("failed to execute ffmpeg: {e}")))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(SceneError::Ffmpeg(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            stderr.lines().last().unwrap_or("")
        )));
    }

    let mut duration: Option<f64> = None;
    let mut fps: Option<f64> = None;
    let mut boundaries: Vec<f64> = Vec::with_capacity(32);

    for line in stderr.lines() {
        if duration.is_none() {
            duration = parse_duration_line(line);
        }
        if fps.is_none() {
            fps = parse_fps_line(line);
        }
        if let Some(timestamp) = parse_boundary_line(line) {
            boundaries.push(timestamp);
        }
    }

    let duration = duration.unwrap_or_else(|| {
        warn!("could not parse duration from ffmpeg output");
        boundaries.last().copied().unwrap_or(0.0)
    });

    let min_gap = f64::from(config.min_scene_len) / fps_or_default(fps);
    let kept = suppress_close_boundaries(&boundaries, min_gap, duration);

    debug!(
        "scdet reported {} boundaries, {} kept after min-scene-length suppression",
        boundaries.len(),
        kept.len()
    );

    let segments = boundaries_to_segments(&kept, duration);
    info!("Detected {} scene segments", segments.len());

    Ok(segments)
}

fn fps_or_default(fps: Option<f64>) -> f64 {
    match fps {
        Some(f) if f > 0.0 => f,
        _ => 30.0,
    }
}

/// Drop boundaries closer than `min_gap` seconds to the previous kept
/// boundary (or to the start of the video), and any at or past `duration`
fn suppress_close_boundaries(boundaries: &[f64], min_gap: f64, duration: f64) -> Vec<f64> {
    let mut kept = Vec::with_capacity(boundaries.len());
    let mut last = 0.0f64;
    for &b in boundaries {
        if duration > 0.0 && b >= duration {
            continue;
        }
        if b - last < min_gap {
            debug!("suppressing boundary at {b:.2}s (too close to {last:.2}s)");
            continue;
        }
        kept.push(b);
        last = b;
    }
    kept
}

/// Convert boundary timestamps into contiguous `[start, end)` segments
///
/// No boundaries yields a single full-duration segment.
fn boundaries_to_segments(boundaries: &[f64], duration: f64) -> Vec<SceneSegment> {
    let mut segments = Vec::with_capacity(boundaries.len() + 1);
    let mut start = 0.0;
    for &b in boundaries {
        segments.push(SceneSegment { start, end: b });
        start = b;
    }
    segments.push(SceneSegment {
        start,
        end: duration.max(start),
    });
    segments
}

/// Parse a boundary timestamp from an scdet stderr line
///
/// Format: `[scdet @ 0x...] lavfi.scd.score: 1.234, lavfi.scd.time: 5.678`
fn parse_boundary_line(line: &str) -> Option<f64> {
    let marker = "lavfi.scd.time: ";
    let start = line.find(marker)? + marker.len();
    line[start..].split_whitespace().next()?.parse().ok()
}

/// Parse the container duration from ffmpeg's stream-info stderr
///
/// Format: `  Duration: HH:MM:SS.MS, start: ...`
fn parse_duration_line(line: &str) -> Option<f64> {
    let marker = "Duration: ";
    let start = line.find(marker)? + marker.len();
    let timestamp = line[start..].split(',').next()?;

    let mut parts = timestamp.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse the stream frame rate from ffmpeg's stream-info stderr
///
/// Format: `  Stream #0:0 ... 1280x720, 30 fps, 30 tbr, ...`
fn parse_fps_line(line: &str) -> Option<f64> {
    if !line.contains("Video:") {
        return None;
    }
    for part in line.split(',') {
        let part = part.trim();
        if let Some(value) = part.strip_suffix(" fps") {
            return value.trim().parse().ok();
        }
    }
    None
}
