//! Frame-sampling and remote-inference pipeline
//!
//! The core of the service: a sequential decode loop feeds sampled frames to
//! a bounded pool of concurrent inference tasks, results are reassembled in
//! frame order regardless of completion order, and progress is streamed to
//! the caller while background persistence runs detached.
//!
//! # Architecture
//!
//! ```text
//! [Decode Thread] --SampledFrame--> [Dispatch Loop] --spawn--> [Inference Tasks]
//!    (FFmpeg)         bounded          (tokio)      JoinSet       (reqwest)
//! ```
//!
//! The decoder is stateful and single-threaded, so the decode thread owns it
//! exclusively. The dispatch loop alone mutates the accumulator; inference
//! tasks hand results back only through their task handles.

mod dispatch;
mod sampling;
mod sink;

pub use dispatch::{dispatch_frames, DecodeMsg, DetectionEvent, PipelineConfig};
pub use sampling::effective_frame_skip;
pub use sink::spawn_persist;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use hoopcut_cache::CacheStore;
use hoopcut_common::{DetectionDocument, Result};
use hoopcut_inference::{InferenceClient, InferenceConfig};
use hoopcut_video_source::VideoSource;

/// Run ball detection over one video
///
/// Opens the video on a dedicated decode thread, samples frames at the
/// effective stride, dispatches bounded concurrent inference, and returns
/// the frame-ordered document. When `events` is given, progress is emitted
/// in completion order while the run executes; event sends are best-effort,
/// so a disconnected consumer does not stop the run. When `cache` is given,
/// the finished document is persisted off the critical path.
///
/// # Errors
///
/// Returns `ClipError::Config` for missing credentials, `ClipError::Open` /
/// `ClipError::NoVideoStream` for an unusable source. Per-frame inference
/// failures never fail the run; they produce empty-box records and are
/// counted in the stats.
pub async fn run_detection(
    video_path: PathBuf,
    inference: Arc<InferenceConfig>,
    config: PipelineConfig,
    events: Option<mpsc::Sender<DetectionEvent>>,
    cache: Option<CacheStore>,
) -> Result<DetectionDocument> {
    // Per-slot clients, built up front so a bad configuration fails the run
    // before any decoding starts.
    let clients = (0..config.max_workers.max(1))
        .map(|_| InferenceClient::new(inference.clone()))
        .collect::<Result<Vec<_>>>()?;

    let (frame_tx, mut frame_rx) = mpsc::channel::<DecodeMsg>(config.max_workers.max(2));

    let path = video_path.clone();
    let decode_config = config.clone();
    let _decode_thread = std::thread::Builder::new()
        .name("hoopcut-decode".to_string())
        .spawn(move || decode_loop(&path, &decode_config, &frame_tx))?;

    let document = dispatch_frames(
        &mut frame_rx,
        &clients,
        inference.as_ref(),
        &config,
        events.as_ref(),
    )
    .await?;

    info!(
        "Detection complete: {} frames processed, {} failed, {} boxes in {:.2}s",
        document.stats.processed_frames,
        document.stats.failed_frames,
        document.stats.total_boxes,
        document.stats.elapsed_seconds
    );

    if let Some(store) = cache {
        // Detached by design: the run's lifecycle does not depend on the
        // persist task, and its failure is logged by the task itself.
        spawn_persist(store, document.clone());
    }

    Ok(document)
}

/// Sequential decode loop, run on its own thread
///
/// Calls `advance()` for every frame and `decode()` only at the sampling
/// stride, then hands the materialized frame to the dispatch loop. A send
/// failure means the dispatcher is gone and reading stops.
fn decode_loop(path: &Path, config: &PipelineConfig, tx: &mpsc::Sender<DecodeMsg>) {
    let mut source = match VideoSource::open(path) {
        Ok(source) => source,
        Err(e) => {
            let _ = tx.blocking_send(DecodeMsg::Fatal(e));
            return;
        }
    };

    let info = source.info().clone();
    let skip = effective_frame_skip(config.frame_skip, info.total_frames, config.target_samples);
    if tx
        .blocking_send(DecodeMsg::Start {
            info: info.clone(),
            effective_skip: skip,
        })
        .is_err()
    {
        return;
    }

    let stride = u64::from(skip);
    loop {
        match source.advance() {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                // Mid-stream demux errors end the readable portion of the
                // video; everything sampled so far still completes.
                warn!("stopping decode at frame {}: {e}", source.index());
                break;
            }
        }

        let index = source.index();
        if index % stride != 0 {
            continue;
        }

        match source.decode() {
            Ok(frame) => {
                let Some(image) =
                    image::RgbImage::from_raw(frame.width, frame.height, frame.data)
                else {
                    warn!("frame {index}: buffer size mismatch, skipping");
                    continue;
                };
                if tx.blocking_send(DecodeMsg::Frame { index, image }).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("stopping decode at frame {index}: {e}");
                break;
            }
        }
    }

    let _ = tx.blocking_send(DecodeMsg::Done);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoopcut_common::ClipError;

    #[tokio::test]
    async fn test_missing_api_key_is_run_fatal() {
        let err = run_detection(
            PathBuf::from("/nonexistent.mp4"),
            Arc::new(InferenceConfig::default()),
            PipelineConfig::default(),
            None,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClipError::Config(_)));
    }

    #[tokio::test]
    async fn test_unopenable_source_is_run_fatal() {
        let inference = Arc::new(InferenceConfig {
            api_key: "test-key".to_string(),
            ..InferenceConfig::default()
        });
        let err = run_detection(
            PathBuf::from("/nonexistent.mp4"),
            inference,
            PipelineConfig::default(),
            None,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClipError::Open(_)));
    }
}
