//! Remote ball-detection client
//!
//! Issues one inference request per sampled frame against a hosted detection
//! endpoint and normalizes the response into [`DetectionBox`] records.
//!
//! The remote API is fed a JPEG-encoded frame as the request body with
//! `api_key`, `confidence` and `overlap` query parameters. Frames wider than
//! the configured limit are downscaled before transmission and the reported
//! coordinates are rescaled back to original-frame pixels — coordinates
//! computed against a resized frame are meaningless without that correction.
//!
//! The response body comes in two recognized shapes: a bare object with a
//! `predictions` list, or a one-element list wrapping such an object. Both
//! are normalized at this boundary; the ambiguity does not propagate.

use image::imageops::FilterType;
use image::RgbImage;
use serde::Deserialize;
use std::borrow::Cow;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use hoopcut_common::{ClipError, DetectionBox, Result};

/// Configuration for the remote detection endpoint
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Full model endpoint URL
    pub endpoint: String,
    /// API key sent as a query parameter; empty means unconfigured
    pub api_key: String,
    /// Minimum confidence for a box to be retained, in [0, 1]
    pub confidence_threshold: f32,
    /// Overlap (NMS) threshold forwarded to the backend, in [0, 1]
    pub overlap_threshold: f32,
    /// Downscale frames wider than this before transmission; 0 disables
    pub infer_max_width: u32,
    /// Fixed per-request timeout
    pub timeout: Duration,
    /// Class label applied when the backend omits one
    pub default_class: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://detect.roboflow.com/made-baskets-gswke/1".to_string(),
            api_key: String::new(),
            confidence_threshold: 0.3,
            overlap_threshold: 0.5,
            infer_max_width: 640,
            timeout: Duration::from_secs(20),
            default_class: "Basketball".to_string(),
        }
    }
}

/// Connection-pooled client for one worker-pool slot
///
/// Request volume per video can reach hundreds; each slot reuses one pooled
/// client across its tasks rather than opening a connection per request.
#[derive(Clone, Debug)]
pub struct InferenceClient {
    http: reqwest::Client,
    config: Arc<InferenceConfig>,
}

impl InferenceClient {
    /// Build a client for one pool slot
    ///
    /// # Errors
    ///
    /// Returns `ClipError::Config` when the API key is missing or the HTTP
    /// client cannot be constructed.
    pub fn new(config: Arc<InferenceConfig>) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(ClipError::Config(
                "inference API key is not set".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClipError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, config })
    }

    /// Endpoint configuration shared by this client
    #[must_use]
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Run detection on one frame
    ///
    /// # Errors
    ///
    /// Returns `ClipError::Inference` on transport failure, non-2xx
    /// response, or malformed response body. Callers treat this as a
    /// per-frame failure, never fatal to a run.
    pub async fn infer_frame(&self, frame: &RgbImage) -> Result<Vec<DetectionBox>> {
        let (width, height) = frame.dimensions();

        let (to_send, scale_x, scale_y) =
            match downscale_plan(width, height, self.config.infer_max_width) {
                Some((new_width, new_height)) => {
                    trace!("downscaling {width}x{height} -> {new_width}x{new_height}");
                    let resized = image::imageops::resize(
                        frame,
                        new_width,
                        new_height,
                        FilterType::Triangle,
                    );
                    (
                        Cow::Owned(resized),
                        f64::from(width) / f64::from(new_width),
                        f64::from(height) / f64::from(new_height),
                    )
                }
                None => (Cow::Borrowed(frame), 1.0, 1.0),
            };

        let mut jpeg = Vec::with_capacity(64 * 1024);
        to_send
            .write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .map_err(|e| ClipError::Inference(format!("JPEG encode failed: {e}")))?;

        let response = self
            .http
            .post(&self.config.endpoint)
            .query(&[("api_key", self.config.api_key.as_str())])
            .query(&[
                ("confidence", self.config.confidence_threshold * 100.0),
                ("overlap", self.config.overlap_threshold * 100.0),
            ])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()
            .await
            .map_err(|e| ClipError::Inference(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ClipError::Inference(format!(
                "detection API returned {}",
                response.status()
            )));
        }

        let payload: InferencePayload = response
            .json()
            .await
            .map_err(|e| ClipError::Inference(format!("malformed response body: {e}")))?;

        let boxes: Vec<DetectionBox> = payload
            .into_predictions()
            .into_iter()
            .filter_map(|pred| {
                to_box(
                    pred,
                    scale_x,
                    scale_y,
                    self.config.confidence_threshold,
                    &self.config.default_class,
                )
            })
            .collect();

        debug!("{} boxes above threshold", boxes.len());
        Ok(boxes)
    }
}

/// The two recognized response shapes, normalized immediately on ingestion
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InferencePayload {
    Batch(Vec<PredictionSet>),
    Single(PredictionSet),
}

#[derive(Debug, Default, Deserialize)]
struct PredictionSet {
    #[serde(default)]
    predictions: Vec<RawPrediction>,
}

/// One prediction as reported by the backend: center-point coordinates
#[derive(Debug, Deserialize)]
struct RawPrediction {
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default)]
    width: f64,
    #[serde(default)]
    height: f64,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    class: Option<String>,
}

impl InferencePayload {
    fn into_predictions(self) -> Vec<RawPrediction> {
        match self {
            InferencePayload::Batch(sets) => sets
                .into_iter()
                .next()
                .map(|set| set.predictions)
                .unwrap_or_default(),
            InferencePayload::Single(set) => set.predictions,
        }
    }
}

/// Map a center-point prediction to a top-left box in original-frame
/// coordinates, dropping it when below the confidence threshold
fn to_box(
    pred: RawPrediction,
    scale_x: f64,
    scale_y: f64,
    threshold: f32,
    default_class: &str,
) -> Option<DetectionBox> {
    let confidence = pred.confidence as f32;
    if confidence < threshold {
        return None;
    }

    let x = (pred.x - pred.width / 2.0) * scale_x;
    let y = (pred.y - pred.height / 2.0) * scale_y;

    Some(DetectionBox {
        x: x.round() as i32,
        y: y.round() as i32,
        w: (pred.width * scale_x).round() as i32,
        h: (pred.height * scale_y).round() as i32,
        confidence,
        class: pred
            .class
            .unwrap_or_else(|| default_class.to_string()),
    })
}

/// Target dimensions when a frame exceeds the width limit, preserving
/// aspect ratio; `None` when no downscale is needed
fn downscale_plan(width: u32, height: u32, max_width: u32) -> Option<(u32, u32)> {
    if max_width == 0 || width <= max_width {
        return None;
    }
    let new_height =
        ((u64::from(height) * u64::from(max_width)) as f64 / f64::from(width)).round() as u32;
    Some((max_width, new_height.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};

    fn pred(x: f64, y: f64, w: f64, h: f64, conf: f64, class: Option<&str>) -> RawPrediction {
        RawPrediction {
            x,
            y,
            width: w,
            height: h,
            confidence: conf,
            class: class.map(str::to_string),
        }
    }

    #[test]
    fn test_center_to_top_left() {
        let result = to_box(pred(100.0, 50.0, 40.0, 60.0, 0.8, None), 1.0, 1.0, 0.5, "Basketball")
            .unwrap();
        assert_eq!((result.x, result.y, result.w, result.h), (80, 20, 40, 60));
        assert_eq!(result.class, "Basketball");
    }

    #[test]
    fn test_rescale_to_original_frame() {
        // Reported against a half-resolution frame
        let result =
            to_box(pred(50.0, 50.0, 20.0, 20.0, 0.9, None), 2.0, 2.0, 0.5, "Basketball").unwrap();
        assert_eq!((result.x, result.y, result.w, result.h), (80, 80, 40, 40));
    }

    #[test]
    fn test_below_threshold_is_dropped() {
        assert!(to_box(pred(10.0, 10.0, 4.0, 4.0, 0.2, None), 1.0, 1.0, 0.5, "b").is_none());
    }

    #[test]
    fn test_class_label_passthrough() {
        let result =
            to_box(pred(10.0, 10.0, 4.0, 4.0, 0.9, Some("Hoop")), 1.0, 1.0, 0.5, "Basketball")
                .unwrap();
        assert_eq!(result.class, "Hoop");
    }

    #[test]
    fn test_payload_bare_object() {
        let json = r#"{"predictions": [{"x": 100, "y": 50, "width": 40, "height": 60, "confidence": 0.8, "class": "Basketball"}]}"#;
        let payload: InferencePayload = serde_json::from_str(json).unwrap();
        let predictions = payload.into_predictions();
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].x, 100.0);
    }

    #[test]
    fn test_payload_list_wrapped() {
        let json = r#"[{"predictions": [{"x": 100, "y": 50, "width": 40, "height": 60, "confidence": 0.8}]}]"#;
        let payload: InferencePayload = serde_json::from_str(json).unwrap();
        let predictions = payload.into_predictions();
        assert_eq!(predictions.len(), 1);
        assert!(predictions[0].class.is_none());
    }

    #[test]
    fn test_payload_empty_list() {
        let payload: InferencePayload = serde_json::from_str("[]").unwrap();
        assert!(payload.into_predictions().is_empty());
    }

    #[test]
    fn test_downscale_plan() {
        // Below the limit: untouched
        assert_eq!(downscale_plan(640, 360, 640), None);
        assert_eq!(downscale_plan(1280, 720, 0), None);
        // Above the limit: aspect preserved
        assert_eq!(downscale_plan(1280, 720, 640), Some((640, 360)));
        assert_eq!(downscale_plan(1920, 1080, 640), Some((640, 360)));
    }

    async fn spawn_mock(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_config(endpoint: String) -> Arc<InferenceConfig> {
        Arc::new(InferenceConfig {
            endpoint,
            api_key: "test-key".to_string(),
            ..InferenceConfig::default()
        })
    }

    #[test]
    fn test_missing_api_key_rejected() {
        let err = InferenceClient::new(Arc::new(InferenceConfig::default())).unwrap_err();
        assert!(matches!(err, ClipError::Config(_)));
    }

    #[tokio::test]
    async fn test_infer_frame_against_mock() {
        let app = Router::new().route(
            "/detect",
            post(|| async {
                Json(serde_json::json!({
                    "predictions": [
                        {"x": 100.0, "y": 50.0, "width": 40.0, "height": 60.0,
                         "confidence": 0.8, "class": "Basketball"},
                        {"x": 10.0, "y": 10.0, "width": 4.0, "height": 4.0,
                         "confidence": 0.1, "class": "Basketball"}
                    ]
                }))
            }),
        );
        let base = spawn_mock(app).await;

        let client = InferenceClient::new(test_config(format!("{base}/detect"))).unwrap();
        let frame = RgbImage::new(64, 48);
        let boxes = client.infer_frame(&frame).await.unwrap();

        // The 0.1-confidence prediction is filtered out
        assert_eq!(boxes.len(), 1);
        assert_eq!((boxes[0].x, boxes[0].y), (80, 20));
    }

    #[tokio::test]
    async fn test_infer_frame_server_error() {
        let app = Router::new().route(
            "/detect",
            post(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let base = spawn_mock(app).await;

        let client = InferenceClient::new(test_config(format!("{base}/detect"))).unwrap();
        let err = client.infer_frame(&RgbImage::new(8, 8)).await.unwrap_err();
        assert!(matches!(err, ClipError::Inference(_)));
    }
}
