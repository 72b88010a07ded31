//! Bitrate smoothing and device-push gating.

/// Default lower bound on the adjusted bitrate, as a fraction of target.
pub const DEFAULT_LOW_FACTOR: f64 = 0.5;
/// Default upper bound on the adjusted bitrate, as a fraction of target.
pub const DEFAULT_HIGH_FACTOR: f64 = 0.95;
/// Units between adjustment decisions.
pub const UPDATE_INTERVAL_FRAMES: u32 = 30;

// Weight of the newest sample in the bytes-per-unit average.
const SMOOTHING: f64 = 0.1;
// Relative tolerance for undershoot and for target changes.
const TOLERANCE: f64 = 0.1;

/// Tracks what the encoder actually produces and derives the bitrate to ask
/// the device for.
///
/// Hardware encoders in CBR mode tend to overshoot their configured rate;
/// feeding them a target scaled into `[low, high] x target` keeps the
/// delivered rate near what the caller asked for.
#[derive(Debug, Clone)]
pub struct RateAdjuster {
    low_factor: f64,
    high_factor: f64,
    target_bps: u32,
    framerate: f64,
    adjusted_bps: u32,
    frame_bytes: Option<f64>,
    frames_since_update: u32,
}

impl RateAdjuster {
    #[must_use]
    pub fn new(low_factor: f64, high_factor: f64) -> Self {
        let (low_factor, high_factor) = if low_factor <= high_factor {
            (low_factor, high_factor)
        } else {
            tracing::warn!(low_factor, high_factor, "rate factors inverted, swapping");
            (high_factor, low_factor)
        };
        Self {
            low_factor,
            high_factor,
            target_bps: 0,
            framerate: 0.0,
            adjusted_bps: 0,
            frame_bytes: None,
            frames_since_update: 0,
        }
    }

    /// Set a new target bitrate and framerate.
    ///
    /// A target that moves by more than 10 % resets the adjusted value and
    /// the estimate window.
    pub fn set_target(&mut self, target_bps: u32, framerate: f64) {
        self.framerate = framerate.max(0.0);
        let previous = f64::from(self.target_bps);
        let next = f64::from(target_bps);
        let changed = self.target_bps == 0 || (next - previous).abs() > previous * TOLERANCE;
        self.target_bps = target_bps;
        if changed {
            self.adjusted_bps = self.clamp(next);
            self.frames_since_update = 0;
            tracing::debug!(target_bps, adjusted_bps = self.adjusted_bps, "rate target reset");
        } else {
            self.adjusted_bps = self.clamp(f64::from(self.adjusted_bps));
        }
    }

    /// Record the size of one delivered access unit.
    pub fn update(&mut self, frame_bytes: usize) {
        #[allow(clippy::cast_precision_loss)]
        let sample = frame_bytes as f64;
        self.frame_bytes = Some(match self.frame_bytes {
            None => sample,
            Some(avg) => avg + SMOOTHING * (sample - avg),
        });

        self.frames_since_update += 1;
        if self.frames_since_update < UPDATE_INTERVAL_FRAMES || self.target_bps == 0 {
            return;
        }
        self.frames_since_update = 0;

        let target = f64::from(self.target_bps);
        let estimate = self.estimated_bitrate();
        if estimate > target || estimate < target * (1.0 - TOLERANCE) {
            let proposed = target + 0.5 * (target - estimate);
            self.adjusted_bps = self.clamp(proposed);
            tracing::trace!(
                target_bps = self.target_bps,
                estimate_bps = estimate,
                adjusted_bps = self.adjusted_bps,
                "rate adjusted"
            );
        }
    }

    fn estimated_bitrate(&self) -> f64 {
        self.frame_bytes.unwrap_or(0.0) * 8.0 * self.framerate
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn clamp(&self, bps: f64) -> u32 {
        let target = f64::from(self.target_bps);
        bps.clamp(target * self.low_factor, target * self.high_factor)
            .round() as u32
    }

    /// Bitrate to push to the device.
    #[must_use]
    pub fn adjusted_bitrate_bps(&self) -> u32 {
        self.adjusted_bps
    }

    /// Smoothed bytes per access unit, if anything was delivered yet.
    #[must_use]
    pub fn estimated_frame_bytes(&self) -> Option<f64> {
        self.frame_bytes
    }

    /// Bitrate implied by the current estimate and framerate.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn estimated_bitrate_bps(&self) -> u32 {
        self.estimated_bitrate().round().min(f64::from(u32::MAX)) as u32
    }
}

impl Default for RateAdjuster {
    fn default() -> Self {
        Self::new(DEFAULT_LOW_FACTOR, DEFAULT_HIGH_FACTOR)
    }
}

/// Per-platform ceiling on the framerate the device is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerateCap {
    /// `high` fps while both sides fit inside `max_width`x`max_height`,
    /// `low` fps otherwise.
    ResolutionTiered {
        max_width: u32,
        max_height: u32,
        high: u32,
        low: u32,
    },
    Fixed(u32),
}

impl FramerateCap {
    /// 60 fps up to 1920x1080, 30 fps above.
    pub const GPU: Self = Self::ResolutionTiered {
        max_width: 1920,
        max_height: 1080,
        high: 60,
        low: 30,
    };

    #[must_use]
    pub fn limit(self, width: u32, height: u32) -> u32 {
        match self {
            Self::ResolutionTiered {
                max_width,
                max_height,
                high,
                low,
            } => {
                if width <= max_width && height <= max_height {
                    high
                } else {
                    low
                }
            }
            Self::Fixed(fps) => fps,
        }
    }
}

/// Suppresses redundant or out-of-range rate pushes to the device.
#[derive(Debug, Clone)]
pub struct RateGate {
    min_bitrate_bps: u32,
    cap: FramerateCap,
    last_bitrate_bps: Option<u32>,
    last_framerate: Option<u32>,
}

impl RateGate {
    #[must_use]
    pub fn new(min_bitrate_bps: u32, cap: FramerateCap) -> Self {
        Self {
            min_bitrate_bps,
            cap,
            last_bitrate_bps: None,
            last_framerate: None,
        }
    }

    /// Start from the values the session was configured with.
    #[must_use]
    pub fn with_applied(mut self, bitrate_bps: u32, framerate: u32) -> Self {
        self.last_bitrate_bps = Some(bitrate_bps);
        self.last_framerate = Some(framerate);
        self
    }

    /// The bitrate to push now, or `None` if it should be skipped.
    pub fn bitrate(&mut self, bitrate_bps: u32) -> Option<u32> {
        if bitrate_bps < self.min_bitrate_bps || self.last_bitrate_bps == Some(bitrate_bps) {
            return None;
        }
        self.last_bitrate_bps = Some(bitrate_bps);
        Some(bitrate_bps)
    }

    /// The capped framerate to push now, or `None` if unchanged.
    pub fn framerate(&mut self, requested: u32, width: u32, height: u32) -> Option<u32> {
        let fps = requested.min(self.cap.limit(width, height)).max(1);
        if self.last_framerate == Some(fps) {
            return None;
        }
        self.last_framerate = Some(fps);
        Some(fps)
    }
}
