//! Clip export via FFmpeg
//!
//! Trims the selected time ranges out of the working video and concatenates
//! them into one output file, video and audio together, using a single
//! ffmpeg `filter_complex` invocation. The encoder runs as an external
//! process with a configured timeout; a non-zero exit or a timeout is an
//! export failure surfaced to the caller.
//!
//! Also provides the upload remux step: repackaging an uploaded file's
//! streams into a faststart MP4 without re-encoding, falling back to a
//! compressing re-encode when the source codecs cannot be stream-copied
//! into MP4.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use hoopcut_common::{ClipError, Result, SceneSegment};

/// Export tuning
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Kill the encoder process after this long
    pub ffmpeg_timeout: Duration,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            ffmpeg_timeout: Duration::from_secs(300),
        }
    }
}

impl ExportConfig {
    /// Read the export configuration from `HOOPCUT_EXPORT_TIMEOUT_SECS`
    #[must_use]
    pub fn from_env() -> Self {
        let secs = std::env::var("HOOPCUT_EXPORT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);
        Self {
            ffmpeg_timeout: Duration::from_secs(secs),
        }
    }
}

/// Trim and concatenate segments into one output file
///
/// Segments are rendered in the given order. `include_audio` must reflect
/// whether the input actually has an audio stream; mapping a missing stream
/// fails the encode.
///
/// # Errors
///
/// Returns `ClipError::Export` on invalid segments, encoder failure, or
/// timeout.
pub async fn export_segments(
    input: &Path,
    output: &Path,
    segments: &[SceneSegment],
    include_audio: bool,
    config: &ExportConfig,
) -> Result<()> {
    validate_segments(segments)?;

    let filter = build_concat_filter(segments, include_audio);
    debug!("export filter graph: {filter}");

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-filter_complex")
        .arg(&filter)
        .arg("-map")
        .arg("[outv]");
    if include_audio {
        cmd.arg("-map").arg("[outa]");
    } else {
        cmd.arg("-an");
    }
    cmd.arg(output);

    info!(
        "Exporting {} segments from {} to {}",
        segments.len(),
        input.display(),
        output.display()
    );
    run_ffmpeg(cmd, config.ffmpeg_timeout).await
}

/// Repackage an upload into a faststart MP4
///
/// Tries a pure stream-copy remux first; when the source codecs cannot live
/// in MP4, falls back to a compressing re-encode.
///
/// # Errors
///
/// Returns `ClipError::Export` when both attempts fail or time out.
pub async fn remux_to_mp4(input: &Path, output: &Path, config: &ExportConfig) -> Result<()> {
    let mut copy = Command::new("ffmpeg");
    copy.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-c")
        .arg("copy")
        .arg("-movflags")
        .arg("+faststart")
        .arg(output);

    match run_ffmpeg(copy, config.ffmpeg_timeout).await {
        Ok(()) => {
            info!("Remuxed {} to {}", input.display(), output.display());
            return Ok(());
        }
        Err(e) => warn!("stream-copy remux failed, re-encoding: {e}"),
    }

    let mut encode = Command::new("ffmpeg");
    encode
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-y")
        .arg("-i")
        .arg(input)
        .arg("-c:v")
        .arg("libx264")
        .arg("-preset")
        .arg("veryfast")
        .arg("-crf")
        .arg("26")
        .arg("-c:a")
        .arg("aac")
        .arg("-movflags")
        .arg("+faststart")
        .arg(output);

    run_ffmpeg(encode, config.ffmpeg_timeout).await?;
    info!("Re-encoded {} to {}", input.display(), output.display());
    Ok(())
}

/// Run an ffmpeg command with a timeout, killing it on expiry
async fn run_ffmpeg(mut cmd: Command, timeout: Duration) -> Result<()> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| ClipError::Export(format!("failed to execute ffmpeg: {e}")))?;

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(waited) => {
            waited.map_err(|e| ClipError::Export(format!("ffmpeg wait failed: {e}")))?
        }
        Err(_) => {
            child.kill().await.ok();
            return Err(ClipError::Export(format!(
                "ffmpeg timed out after {}s",
                timeout.as_secs()
            )));
        }
    };

    if status.success() {
        return Ok(());
    }

    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        pipe.read_to_string(&mut stderr).await.ok();
    }
    Err(ClipError::Export(format!(
        "ffmpeg exited with {status}: {}",
        stderr.trim()
    )))
}

/// Build the trim/concat filter graph for the selected segments
fn build_concat_filter(segments: &[SceneSegment], include_audio: bool) -> String {
    let mut graph = String::with_capacity(segments.len() * 96);
    let mut concat_inputs = String::with_capacity(segments.len() * 10);

    for (i, segment) in segments.iter().enumerate() {
        graph.push_str(&format!(
            "[0:v]trim=start={:.3}:end={:.3},setpts=PTS-STARTPTS[v{i}];",
            segment.start, segment.end
        ));
        concat_inputs.push_str(&format!("[v{i}]"));
        if include_audio {
            graph.push_str(&format!(
                "[0:a]atrim=start={:.3}:end={:.3},asetpts=PTS-STARTPTS[a{i}];",
                segment.start, segment.end
            ));
            concat_inputs.push_str(&format!("[a{i}]"));
        }
    }

    let (audio_count, outputs) = if include_audio {
        (1, "[outv][outa]")
    } else {
        (0, "[outv]")
    };
    graph.push_str(&format!(
        "{concat_inputs}concat=n={}:v=1:a={audio_count}{outputs}",
        segments.len()
    ));
    graph
}

/// Reject empty selections and degenerate time ranges
fn validate_segments(segments: &[SceneSegment]) -> Result<()> {
    if segments.is_empty() {
        return Err(ClipError::Export("no segments selected".to_string()));
    }
    for segment in segments {
        if !segment.start.is_finite() || !segment.end.is_finite() {
            return Err(ClipError::Export(format!(
                "segment bounds must be finite, got {:?}-{:?}",
                segment.start, segment.end
            )));
        }
        if segment.start < 0.0 || segment.end <= segment.start {
            return Err(ClipError::Export(format!(
                "invalid segment {:.3}-{:.3}",
                segment.start, segment.end
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64) -> SceneSegment {
        SceneSegment { start, end }
    }

    #[test]
    fn test_filter_graph_single_segment_with_audio() {
        let graph = build_concat_filter(&[seg(0.0, 5.0)], true);
        assert_eq!(
            graph,
            "[0:v]trim=start=0.000:end=5.000,setpts=PTS-STARTPTS[v0];\
             [0:a]atrim=start=0.000:end=5.000,asetpts=PTS-STARTPTS[a0];\
             [v0][a0]concat=n=1:v=1:a=1[outv][outa]"
        );
    }

    #[test]
    fn test_filter_graph_two_segments_video_only() {
        let graph = build_concat_filter(&[seg(0.0, 5.0), seg(7.5, 10.0)], false);
        assert_eq!(
            graph,
            "[0:v]trim=start=0.000:end=5.000,setpts=PTS-STARTPTS[v0];\
             [0:v]trim=start=7.500:end=10.000,setpts=PTS-STARTPTS[v1];\
             [v0][v1]concat=n=2:v=1:a=0[outv]"
        );
    }

    #[test]
    fn test_validate_rejects_bad_segments() {
        assert!(validate_segments(&[]).is_err());
        assert!(validate_segments(&[seg(5.0, 5.0)]).is_err());
        assert!(validate_segments(&[seg(5.0, 2.0)]).is_err());
        assert!(validate_segments(&[seg(-1.0, 2.0)]).is_err());
        assert!(validate_segments(&[seg(0.0, f64::NAN)]).is_err());
        assert!(validate_segments(&[seg(0.0, 5.0), seg(5.0, 10.0)]).is_ok());
    }

    #[tokio::test]
    async fn test_export_invalid_segments_fail_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let err = export_segments(
            &dir.path().join("missing.mp4"),
            &dir.path().join("out.mp4"),
            &[],
            true,
            &ExportConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClipError::Export(_)));
    }
}
