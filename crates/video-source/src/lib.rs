//! Sequential video frame source
//!
//! Wraps an `FFmpeg` decode context as a forward-only frame iterator with a
//! cheap-skip/expensive-materialize split:
//!
//! - [`VideoSource::advance`] demuxes and decodes the next frame into the
//!   held libavcodec frame without pixel-format conversion or copy.
//! - [`VideoSource::decode`] runs the RGB24 scaler over the current frame
//!   and copies it out.
//!
//! A sampling loop that only materializes every Nth frame calls `advance()`
//! for every frame and `decode()` only on the frames it keeps, skipping the
//! conversion cost for the rest.

use ffmpeg_next as ffmpeg;
use std::path::Path;
use tracing::debug;

use hoopcut_common::{ClipError, Result, VideoInfo};

/// Initialize `FFmpeg` library
fn init_ffmpeg() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        ffmpeg::init().expect("Failed to initialize FFmpeg");
    });
}

/// A decoded RGB24 frame
#[derive(Debug, Clone)]
pub struct RgbFrame {
    /// Original (un-skipped) frame index in the source video
    pub index: u64,
    pub width: u32,
    pub height: u32,
    /// Raw RGB24 pixel data, row-major, no padding
    pub data: Vec<u8>,
}

/// Sequential forward-only frame source over a video file
///
/// The decode context is stateful and not safely shareable; a source is
/// owned by exactly one reading loop.
pub struct VideoSource {
    ictx: ffmpeg::format::context::Input,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
    stream_index: usize,
    info: VideoInfo,
    current: ffmpeg::util::frame::video::Video,
    index: i64,
    eof_sent: bool,
    done: bool,
}

impl VideoSource {
    /// Open a video file for sequential reading
    ///
    /// # Errors
    ///
    /// Returns `ClipError::Open` if the container cannot be opened or the
    /// decoder cannot be created, `ClipError::NoVideoStream` if the file
    /// has no video stream.
    pub fn open(path: &Path) -> Result<Self> {
        init_ffmpeg();

        let ictx = ffmpeg::format::input(&path)
            .map_err(|e| ClipError::Open(format!("{}: {e}", path.display())))?;

        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or(ClipError::NoVideoStream)?;
        let stream_index = stream.index();

        let fps = fps_from_rational(stream.avg_frame_rate().0, stream.avg_frame_rate().1);
        let duration = if ictx.duration() > 0 {
            ictx.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)
        } else {
            0.0
        };
        let total_frames = estimate_total_frames(stream.frames(), duration, fps);

        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| ClipError::Open(format!("failed to create codec context: {e}")))?
            .decoder()
            .video()
            .map_err(|e| ClipError::Open(format!("failed to create decoder: {e}")))?;

        let has_audio = ictx.streams().best(ffmpeg::media::Type::Audio).is_some();

        let info = VideoInfo {
            width: decoder.width(),
            height: decoder.height(),
            fps,
            total_frames,
            duration,
            has_audio,
        };

        debug!(
            "Opened {}: {}x{}, {:.2} fps, {} frames, {:.2}s",
            path.display(),
            info.width,
            info.height,
            info.fps,
            info.total_frames,
            info.duration
        );

        Ok(Self {
            ictx,
            decoder,
            scaler: None,
            stream_index,
            info,
            current: ffmpeg::util::frame::video::Video::empty(),
            index: -1,
            eof_sent: false,
            done: false,
        })
    }

    /// Container-level metadata captured at open time
    #[must_use]
    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    /// Index of the current frame, valid after the first `advance()`
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index.max(0) as u64
    }

    /// Step to the next frame without materializing pixel data
    ///
    /// Returns `Ok(false)` when the stream is exhausted; exhaustion is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns `ClipError::Open` if the demuxer fails mid-stream.
    pub fn advance(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }

        loop {
            if self.decoder.receive_frame(&mut self.current).is_ok() {
                self.index += 1;
                return Ok(true);
            }

            if self.eof_sent {
                self.done = true;
                return Ok(false);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.ictx) {
                Ok(()) => {
                    if packet.stream() == self.stream_index {
                        // Corrupt packets are skipped, matching the demuxer's
                        // own tolerance for damaged input.
                        if let Err(e) = self.decoder.send_packet(&packet) {
                            debug!("dropping undecodable packet: {e}");
                        }
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().ok();
                    self.eof_sent = true;
                }
                Err(e) => {
                    return Err(ClipError::Open(format!("packet read failed: {e}")));
                }
            }
        }
    }

    /// Materialize the current frame as RGB24 pixel data
    ///
    /// This is the expensive half of the iteration contract: pixel-format
    /// conversion plus a stride-aware copy.
    ///
    /// # Errors
    ///
    /// Returns `ClipError::Open` if called before the first `advance()` or
    /// if the conversion fails.
    pub fn decode(&mut self) -> Result<RgbFrame> {
        if self.index < 0 {
            return Err(ClipError::Open(
                "decode() called before advance()".to_string(),
            ));
        }

        let width = self.current.width();
        let height = self.current.height();

        let scaler = match self.scaler.as_mut() {
            Some(scaler) => scaler,
            None => {
                let scaler = ffmpeg::software::scaling::Context::get(
                    self.current.format(),
                    width,
                    height,
                    ffmpeg::format::Pixel::RGB24,
                    width,
                    height,
                    ffmpeg::software::scaling::Flags::BILINEAR,
                )
                .map_err(|e| ClipError::Open(format!("failed to create scaler: {e}")))?;
                self.scaler.insert(scaler)
            }
        };

        let mut converted = ffmpeg::util::frame::video::Video::empty();
        scaler
            .run(&self.current, &mut converted)
            .map_err(|e| ClipError::Open(format!("frame conversion failed: {e}")))?;

        Ok(RgbFrame {
            index: self.index as u64,
            width,
            height,
            data: copy_rgb_rows(&converted),
        })
    }
}

/// Copy RGB24 frame data to a contiguous buffer, dropping row padding
fn copy_rgb_rows(frame: &ffmpeg::util::frame::video::Video) -> Vec<u8> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let plane = frame.data(0);

    let mut data = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let row_start = y * stride;
        data.extend_from_slice(&plane[row_start..row_start + width * 3]);
    }
    data
}

/// Frame rate from a stream's rational, 0.0 when unknown
fn fps_from_rational(num: i32, den: i32) -> f64 {
    if den > 0 && num > 0 {
        f64::from(num) / f64::from(den)
    } else {
        0.0
    }
}

/// Total frame count: prefer the container's value, estimate from
/// duration otherwise, 0 when neither is available
fn estimate_total_frames(stream_frames: i64, duration: f64, fps: f64) -> i64 {
    if stream_frames > 0 {
        stream_frames
    } else if duration > 0.0 && fps > 0.0 {
        (duration * fps).round() as i64
    } else {
        0
    }
}

/// Probe container-level metadata without setting up frame iteration
///
/// # Errors
///
/// Returns `ClipError::Open` / `ClipError::NoVideoStream` like
/// [`VideoSource::open`].
pub fn probe(path: &Path) -> Result<VideoInfo> {
    Ok(VideoSource::open(path)?.info().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fps_from_rational() {
        assert!((fps_from_rational(30, 1) - 30.0).abs() < f64::EPSILON);
        assert!((fps_from_rational(30000, 1001) - 29.97).abs() < 0.01);
        assert_eq!(fps_from_rational(0, 0), 0.0);
        assert_eq!(fps_from_rational(25, 0), 0.0);
    }

    #[test]
    fn test_estimate_total_frames() {
        // Container reports a count: use it verbatim
        assert_eq!(estimate_total_frames(9000, 300.0, 30.0), 9000);
        // No count: estimate from duration
        assert_eq!(estimate_total_frames(0, 10.0, 30.0), 300);
        // Nothing known
        assert_eq!(estimate_total_frames(0, 0.0, 0.0), 0);
        assert_eq!(estimate_total_frames(-1, 0.0, 30.0), 0);
    }

    #[test]
    fn test_open_missing_file() {
        let err = VideoSource::open(Path::new("/nonexistent/clip.mp4")).unwrap_err();
        assert!(matches!(err, ClipError::Open(_)));
    }
}
