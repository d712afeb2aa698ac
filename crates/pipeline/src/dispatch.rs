//! Bounded concurrent dispatcher
//!
//! Consumes sampled frames from the decode side and runs inference over a
//! fixed-size worker pool. Two independent bounds apply:
//!
//! - a semaphore of `max_workers` permits caps truly concurrent outbound
//!   requests;
//! - the in-flight task set is capped at `max_workers * 2`, which caps the
//!   memory held by decoded frames read ahead of the pool.
//!
//! When the cap is reached the loop stops submitting, waits for at least one
//! completion, then drains every already-completed task in one pass. The
//! final sequence is sorted by original frame index before it is treated as
//! authoritative; streaming emission happens earlier, in completion order.

use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use hoopcut_common::{
    ClipError, DetectionBox, DetectionDocument, DetectionSettings, DetectionStats,
    FrameDetections, Result, VideoInfo,
};
use hoopcut_inference::{InferenceClient, InferenceConfig};

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Requested sampling stride; 0 means auto from `target_samples`
    pub frame_skip: u32,
    /// Approximate sample count the auto stride aims for
    pub target_samples: u32,
    /// Worker pool size
    pub max_workers: usize,
    /// Emit a progress log line every N processed frames
    pub progress_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_skip: 0,
            target_samples: 450,
            max_workers: 8,
            progress_every: 100,
        }
    }
}

/// Messages from the decode thread to the dispatch loop
#[derive(Debug)]
pub enum DecodeMsg {
    /// Stream metadata plus the computed stride; always the first message
    Start { info: VideoInfo, effective_skip: u32 },
    /// One sampled, materialized frame
    Frame { index: u64, image: RgbImage },
    /// The source is exhausted
    Done,
    /// The source could not be opened; fatal to the run
    Fatal(ClipError),
}

/// Streamed progress messages, one JSON object per line on the wire
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DetectionEvent {
    Meta {
        settings: DetectionSettings,
        #[serde(skip_serializing_if = "Option::is_none")]
        video: Option<VideoInfo>,
    },
    Detection {
        #[serde(flatten)]
        record: FrameDetections,
    },
    Error {
        message: String,
    },
    Done {
        stats: DetectionStats,
        cached: bool,
    },
}

type TaskOutput = (u64, Result<Vec<DetectionBox>>);

/// Run the dispatch loop over a decode channel
///
/// Exposed separately from [`crate::run_detection`] so the dispatcher can be
/// driven with synthetic frames.
///
/// # Errors
///
/// Returns the error carried by a `Fatal` message; per-frame inference
/// failures are absorbed into the stats.
pub async fn dispatch_frames(
    rx: &mut mpsc::Receiver<DecodeMsg>,
    clients: &[InferenceClient],
    inference: &InferenceConfig,
    config: &PipelineConfig,
    events: Option<&mpsc::Sender<DetectionEvent>>,
) -> Result<DetectionDocument> {
    let (info, skip) = match rx.recv().await {
        Some(DecodeMsg::Start {
            info,
            effective_skip,
        }) => (info, effective_skip),
        Some(DecodeMsg::Fatal(e)) => return Err(e),
        _ => {
            return Err(ClipError::Open(
                "decoder exited before reporting stream info".to_string(),
            ))
        }
    };

    let max_workers = config.max_workers.max(1);
    let settings = DetectionSettings {
        requested_frame_skip: config.frame_skip,
        effective_frame_skip: skip,
        target_samples: config.target_samples,
        confidence_threshold: inference.confidence_threshold,
        max_workers: max_workers as u32,
        infer_max_width: inference.infer_max_width,
    };

    emit(
        events,
        DetectionEvent::Meta {
            settings: settings.clone(),
            video: Some(info.clone()),
        },
    )
    .await;

    info!(
        "Sampling every {} of {} frames with {} workers",
        skip, info.total_frames, max_workers
    );

    let inflight_cap = max_workers * 2;
    let slots = Arc::new(Semaphore::new(max_workers));
    let mut inflight: JoinSet<TaskOutput> = JoinSet::new();

    let expected = if info.total_frames > 0 {
        (info.total_frames as usize / skip.max(1) as usize) + 1
    } else {
        128
    };
    let mut acc = Accumulator {
        records: Vec::with_capacity(expected),
        failed_frames: 0,
        fps: info.fps,
        total_frames: info.total_frames,
        progress_every: config.progress_every,
        started: Instant::now(),
        events,
    };

    let mut submitted: u64 = 0;
    loop {
        let Some(msg) = rx.recv().await else {
            // Decode thread died without a Done; finish what is in flight.
            warn!("decode channel closed unexpectedly");
            break;
        };
        match msg {
            DecodeMsg::Frame { index, image } => {
                while inflight.len() >= inflight_cap {
                    if let Some(joined) = inflight.join_next().await {
                        acc.settle(joined).await;
                    }
                    while let Some(joined) = inflight.try_join_next() {
                        acc.settle(joined).await;
                    }
                }

                let client = clients[submitted as usize % clients.len()].clone();
                let slots = slots.clone();
                submitted += 1;
                inflight.spawn(async move {
                    let _slot = match slots.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return (
                                index,
                                Err(ClipError::Inference("worker pool closed".to_string())),
                            )
                        }
                    };
                    let outcome = client.infer_frame(&image).await;
                    (index, outcome)
                });
            }
            DecodeMsg::Done => break,
            DecodeMsg::Fatal(e) => return Err(e),
            DecodeMsg::Start { .. } => {}
        }
    }

    // Drain everything still in flight with the same logic.
    while let Some(joined) = inflight.join_next().await {
        acc.settle(joined).await;
        while let Some(joined) = inflight.try_join_next() {
            acc.settle(joined).await;
        }
    }

    // Completion order is never meaningful; frame order is authoritative.
    let mut records = acc.records;
    records.sort_unstable_by_key(|record| record.frame);

    let stats = DetectionStats {
        processed_frames: records.len() as u64,
        failed_frames: acc.failed_frames,
        total_frames: info.total_frames,
        frames_with_boxes: records.iter().filter(|r| !r.boxes.is_empty()).count() as u64,
        total_boxes: records.iter().map(|r| r.boxes.len() as u64).sum(),
        elapsed_seconds: acc.started.elapsed().as_secs_f64(),
    };

    emit(
        events,
        DetectionEvent::Done {
            stats: stats.clone(),
            cached: false,
        },
    )
    .await;

    Ok(DetectionDocument {
        settings,
        stats,
        detections: records,
    })
}

async fn emit(events: Option<&mpsc::Sender<DetectionEvent>>, event: DetectionEvent) {
    if let Some(tx) = events {
        // Best-effort: a disconnected stream consumer never stops the run.
        tx.send(event).await.ok();
    }
}

/// Completion-side state, mutated only by the dispatch loop
struct Accumulator<'a> {
    records: Vec<FrameDetections>,
    failed_frames: u64,
    fps: f64,
    total_frames: i64,
    progress_every: u64,
    started: Instant,
    events: Option<&'a mpsc::Sender<DetectionEvent>>,
}

impl Accumulator<'_> {
    async fn settle(
        &mut self,
        joined: std::result::Result<TaskOutput, tokio::task::JoinError>,
    ) {
        let (index, outcome) = match joined {
            Ok(output) => output,
            Err(e) => {
                // A panicked task cannot be attributed to a frame index.
                warn!("inference task did not complete: {e}");
                self.failed_frames += 1;
                return;
            }
        };

        let boxes = match outcome {
            Ok(boxes) => boxes,
            Err(e) => {
                debug!("frame {index}: {e}");
                self.failed_frames += 1;
                Vec::new()
            }
        };

        let time = if self.fps > 0.0 {
            index as f64 / self.fps
        } else {
            0.0
        };
        let record = FrameDetections {
            time,
            frame: index,
            boxes,
        };

        if let Some(tx) = self.events {
            tx.send(DetectionEvent::Detection {
                record: record.clone(),
            })
            .await
            .ok();
        }
        self.records.push(record);

        let processed = self.records.len() as u64;
        if self.progress_every > 0 && processed % self.progress_every == 0 {
            let percent = if self.total_frames > 0 {
                index as f64 / self.total_frames as f64 * 100.0
            } else {
                0.0
            };
            let boxes_found: usize = self.records.iter().map(|r| r.boxes.len()).sum();
            info!(
                "Progress: {percent:.1}% ({processed} frames, {boxes_found} boxes, {:.1}s)",
                self.started.elapsed().as_secs_f64()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_info() -> VideoInfo {
        VideoInfo {
            width: 64,
            height: 48,
            fps: 30.0,
            total_frames: 800,
            duration: 800.0 / 30.0,
            has_audio: false,
        }
    }

    fn test_inference(endpoint: String) -> Arc<InferenceConfig> {
        Arc::new(InferenceConfig {
            endpoint,
            api_key: "test-key".to_string(),
            ..InferenceConfig::default()
        })
    }

    fn make_clients(inference: &Arc<InferenceConfig>, n: usize) -> Vec<InferenceClient> {
        (0..n)
            .map(|_| InferenceClient::new(inference.clone()).unwrap())
            .collect()
    }

    async fn spawn_mock(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn one_ball_body() -> Json<serde_json::Value> {
        Json(serde_json::json!({
            "predictions": [
                {"x": 50.0, "y": 50.0, "width": 20.0, "height": 20.0,
                 "confidence": 0.9, "class": "Basketball"}
            ]
        }))
    }

    /// Feed `count` sampled frames at `skip` stride through a channel
    fn feed_frames(
        count: u64,
        skip: u32,
    ) -> (mpsc::Receiver<DecodeMsg>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(4);
        let feeder = tokio::spawn(async move {
            tx.send(DecodeMsg::Start {
                info: test_info(),
                effective_skip: skip,
            })
            .await
            .unwrap();
            for i in 0..count {
                tx.send(DecodeMsg::Frame {
                    index: i * u64::from(skip),
                    image: RgbImage::new(8, 8),
                })
                .await
                .unwrap();
            }
            tx.send(DecodeMsg::Done).await.unwrap();
        });
        (rx, feeder)
    }

    #[tokio::test]
    async fn test_results_are_frame_ordered_and_complete() {
        let app = Router::new().route("/detect", post(|| async { one_ball_body() }));
        let base = spawn_mock(app).await;
        let inference = test_inference(format!("{base}/detect"));
        let clients = make_clients(&inference, 4);
        let config = PipelineConfig {
            max_workers: 4,
            ..PipelineConfig::default()
        };

        let (mut rx, feeder) = feed_frames(40, 20);
        let doc = dispatch_frames(&mut rx, &clients, &inference, &config, None)
            .await
            .unwrap();
        feeder.await.unwrap();

        assert_eq!(doc.detections.len(), 40);
        assert_eq!(doc.settings.effective_frame_skip, 20);
        for (i, record) in doc.detections.iter().enumerate() {
            assert_eq!(record.frame, i as u64 * 20);
            assert_eq!(record.frame % 20, 0);
            assert_eq!(record.boxes.len(), 1);
            assert!((record.time - record.frame as f64 / 30.0).abs() < 1e-9);
        }
        // Strictly ascending, no duplicates
        for pair in doc.detections.windows(2) {
            assert!(pair[0].frame < pair[1].frame);
        }
        assert_eq!(doc.stats.processed_frames, 40);
        assert_eq!(doc.stats.failed_frames, 0);
        assert_eq!(doc.stats.total_boxes, 40);
    }

    #[tokio::test]
    async fn test_single_failure_degrades_gracefully() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/detect",
                post(|State(hits): State<Arc<AtomicUsize>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 3 {
                        Err(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
                    } else {
                        Ok(one_ball_body())
                    }
                }),
            )
            .with_state(hits.clone());
        let base = spawn_mock(app).await;
        let inference = test_inference(format!("{base}/detect"));
        let clients = make_clients(&inference, 2);
        let config = PipelineConfig {
            max_workers: 2,
            ..PipelineConfig::default()
        };

        let (mut rx, feeder) = feed_frames(20, 5);
        let doc = dispatch_frames(&mut rx, &clients, &inference, &config, None)
            .await
            .unwrap();
        feeder.await.unwrap();

        // The failed frame keeps its record, with an empty box list
        assert_eq!(doc.detections.len(), 20);
        assert_eq!(doc.stats.failed_frames, 1);
        let empty: Vec<_> = doc
            .detections
            .iter()
            .filter(|r| r.boxes.is_empty())
            .collect();
        assert_eq!(empty.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_stays_within_worker_cap() {
        struct Gauge {
            current: AtomicUsize,
            peak: AtomicUsize,
        }
        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let app = Router::new()
            .route(
                "/detect",
                post(|State(gauge): State<Arc<Gauge>>| async move {
                    let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
                    gauge.peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    gauge.current.fetch_sub(1, Ordering::SeqCst);
                    one_ball_body()
                }),
            )
            .with_state(gauge.clone());
        let base = spawn_mock(app).await;
        let inference = test_inference(format!("{base}/detect"));
        let clients = make_clients(&inference, 2);
        let config = PipelineConfig {
            max_workers: 2,
            ..PipelineConfig::default()
        };

        let (mut rx, feeder) = feed_frames(12, 10);
        let doc = dispatch_frames(&mut rx, &clients, &inference, &config, None)
            .await
            .unwrap();
        feeder.await.unwrap();

        assert_eq!(doc.detections.len(), 12);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_events_stream_meta_detections_done() {
        let app = Router::new().route("/detect", post(|| async { one_ball_body() }));
        let base = spawn_mock(app).await;
        let inference = test_inference(format!("{base}/detect"));
        let clients = make_clients(&inference, 2);
        let config = PipelineConfig {
            max_workers: 2,
            ..PipelineConfig::default()
        };

        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (mut rx, feeder) = feed_frames(5, 10);
        let doc = dispatch_frames(&mut rx, &clients, &inference, &config, Some(&events_tx))
            .await
            .unwrap();
        feeder.await.unwrap();
        drop(events_tx);

        let mut events = Vec::new();
        while let Some(event) = events_rx.recv().await {
            events.push(event);
        }

        assert_eq!(events.len(), 7);
        assert!(matches!(events.first(), Some(DetectionEvent::Meta { .. })));
        assert!(matches!(
            events.last(),
            Some(DetectionEvent::Done { cached: false, .. })
        ));
        let detections = events
            .iter()
            .filter(|e| matches!(e, DetectionEvent::Detection { .. }))
            .count();
        assert_eq!(detections, 5);
        assert_eq!(doc.detections.len(), 5);
    }

    #[tokio::test]
    async fn test_fatal_message_aborts_run() {
        let inference = test_inference("http://127.0.0.1:9/unused".to_string());
        let clients = make_clients(&inference, 1);
        let config = PipelineConfig::default();

        let (tx, mut rx) = mpsc::channel(1);
        tx.send(DecodeMsg::Fatal(ClipError::Open("bad file".to_string())))
            .await
            .unwrap();

        let err = dispatch_frames(&mut rx, &clients, &inference, &config, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClipError::Open(_)));
    }

    #[test]
    fn test_event_serialization_tags() {
        let event = DetectionEvent::Detection {
            record: FrameDetections {
                time: 1.0,
                frame: 30,
                boxes: vec![],
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"detection\""));
        assert!(json.contains("\"frame\":30"));

        let event = DetectionEvent::Error {
            message: "missing credentials".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"error\""));
    }
}
