//! Sampling policy
//!
//! Keeps per-video inference call volume roughly constant regardless of
//! video length: a 2-hour game and a 20-second clip should issue a similar
//! number of requests against the rate-limited external API.

/// Compute the effective sampling stride
///
/// An explicit caller request always wins. With an unknown total frame
/// count there is nothing to scale against, so every frame is sampled.
/// Otherwise the stride is chosen so roughly `target_samples` frames are
/// inferred across the whole video.
#[must_use]
pub fn effective_frame_skip(requested: u32, total_frames: i64, target_samples: u32) -> u32 {
    if requested > 0 {
        return requested;
    }
    if total_frames <= 0 {
        return 1;
    }
    let target = i64::from(target_samples.max(1));
    let skip = (total_frames + target - 1) / target;
    (skip.max(1)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_stride_targets_sample_count() {
        assert_eq!(effective_frame_skip(0, 9000, 450), 20);
        assert_eq!(effective_frame_skip(0, 9001, 450), 21);
        assert_eq!(effective_frame_skip(0, 100, 450), 1);
    }

    #[test]
    fn test_explicit_request_wins() {
        assert_eq!(effective_frame_skip(7, 9000, 450), 7);
        assert_eq!(effective_frame_skip(7, 0, 450), 7);
        assert_eq!(effective_frame_skip(1, 1_000_000, 450), 1);
    }

    #[test]
    fn test_unknown_total_falls_back_to_one() {
        assert_eq!(effective_frame_skip(0, 0, 450), 1);
        assert_eq!(effective_frame_skip(0, -1, 450), 1);
    }

    #[test]
    fn test_zero_target_samples_guarded() {
        assert_eq!(effective_frame_skip(0, 9000, 0), 9000);
    }
}
