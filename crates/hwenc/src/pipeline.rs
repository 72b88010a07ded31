//! Pipeline facade: the public configure/encode/release surface.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{
    self, EncoderCapabilities, HardwareEncoder, InputFormat, Profile, SessionParams,
    MIN_BITRATE_BPS,
};
use crate::config::EncoderConfig;
use crate::delivery::{lock_shared, DeliveryContext, EncodedSink, SharedSink};
use crate::frame::{ContentType, FrameBuffer, FrameType, RawFrame};
use crate::ledger::FrameParamLedger;
use crate::platform::{self, PlatformGuard};
use crate::rate::{RateAdjuster, DEFAULT_HIGH_FACTOR, DEFAULT_LOW_FACTOR};
use crate::session::{SessionController, SessionState};
use crate::EncodeError;

/// Running counters, updated from both the submission and delivery threads.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub sessions_configured: AtomicU64,
    pub releases: AtomicU64,
    pub frames_submitted: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub units_delivered: AtomicU64,
    pub stale_outputs: AtomicU64,
    pub delivery_failures: AtomicU64,
    pub malformed_units: AtomicU64,
    pub device_errors: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sessions_configured: u64,
    pub releases: u64,
    pub frames_submitted: u64,
    pub frames_skipped: u64,
    pub units_delivered: u64,
    pub stale_outputs: u64,
    pub delivery_failures: u64,
    pub malformed_units: u64,
    pub device_errors: u64,
}

impl PipelineStats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_configured: self.sessions_configured.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            units_delivered: self.units_delivered.load(Ordering::Relaxed),
            stale_outputs: self.stale_outputs.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            malformed_units: self.malformed_units.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
        }
    }
}

/// Construction-time knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Upper bound on how long `release` waits for the device to flush.
    pub drain_timeout: Duration,
    /// Capacity of the completion channel.
    pub completion_queue_depth: usize,
    pub low_factor: f64,
    pub high_factor: f64,
    /// Floor for bitrate pushes; the backend's own minimum still applies.
    pub min_bitrate_bps: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(2),
            completion_queue_depth: 16,
            low_factor: DEFAULT_LOW_FACTOR,
            high_factor: DEFAULT_HIGH_FACTOR,
            min_bitrate_bps: MIN_BITRATE_BPS,
        }
    }
}

/// Stream settings passed to [`Pipeline::configure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u32,
    pub framerate: u32,
    pub key_frame_interval: u32,
    pub content_type: ContentType,
    /// `None` uses the backend's default profile.
    pub profile: Option<Profile>,
}

/// Hardware H.264 encoder pipeline.
///
/// Frames go in through [`encode`](Self::encode) on the caller's thread;
/// encoded units come out on the delivery thread through the sink set with
/// [`register_sink`](Self::register_sink).
pub struct Pipeline {
    session: SessionController,
    ledger: Arc<FrameParamLedger>,
    rate: Arc<Mutex<RateAdjuster>>,
    sink: SharedSink,
    /// Set once a sink is registered; checked without taking the sink lock,
    /// which the delivery thread holds while the sink runs.
    has_sink: AtomicBool,
    stats: Arc<PipelineStats>,
    /// Settings of the last successful configure, with rate updates applied.
    settings: Option<EncoderSettings>,
    _platform: Option<PlatformGuard>,
}

impl Pipeline {
    /// Wrap `backend`, initializing its platform if this is the first user.
    ///
    /// # Errors
    ///
    /// Whatever the platform init hook returns.
    pub fn new(
        backend: Box<dyn HardwareEncoder>,
        options: PipelineOptions,
    ) -> Result<Self, EncodeError> {
        let platform = backend.platform().map(platform::acquire).transpose()?;
        let mut session = SessionController::new(
            backend,
            options.drain_timeout,
            options.completion_queue_depth,
        );
        session.set_min_bitrate(options.min_bitrate_bps);

        Ok(Self {
            session,
            ledger: Arc::new(FrameParamLedger::new(0)),
            rate: Arc::new(Mutex::new(RateAdjuster::new(
                options.low_factor,
                options.high_factor,
            ))),
            sink: Arc::new(Mutex::new(None)),
            has_sink: AtomicBool::new(false),
            stats: Arc::new(PipelineStats::default()),
            settings: None,
            _platform: platform,
        })
    }

    /// Create the configured backend and wrap it.
    ///
    /// # Errors
    ///
    /// [`EncodeError::BackendUnavailable`] if the backend is not compiled
    /// in, or a platform init failure.
    pub fn from_config(config: &EncoderConfig) -> Result<Self, EncodeError> {
        Self::new(backend::create(config.backend)?, config.pipeline_options())
    }

    /// Attach the consumer of encoded units, replacing any previous one.
    pub fn register_sink(&self, sink: impl EncodedSink + 'static) {
        *lock_shared(&self.sink) = Some(Box::new(sink));
        self.has_sink.store(true, Ordering::Release);
    }

    /// Negotiate a session for planar input at the given settings.
    ///
    /// # Errors
    ///
    /// [`EncodeError::Device`] if the resolution is out of range or the
    /// device rejects the session; the pipeline is then uninitialized.
    pub fn configure(&mut self, settings: &EncoderSettings) -> Result<(), EncodeError> {
        let caps = self.session.capabilities();
        if !caps.supports_resolution(settings.width, settings.height) {
            self.release();
            return Err(EncodeError::device(
                "negotiate resolution",
                format!(
                    "{}x{} outside {:?}..={:?}",
                    settings.width, settings.height, caps.min_resolution, caps.max_resolution
                ),
            ));
        }
        self.release();
        self.start_session(settings, InputFormat::I420)?;
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn start_session(
        &mut self,
        settings: &EncoderSettings,
        input: InputFormat,
    ) -> Result<(), EncodeError> {
        let caps = self.session.capabilities();
        let framerate = caps
            .framerate_cap
            .limit(settings.width, settings.height)
            .min(settings.framerate.max(1));
        lock_shared(&self.rate).set_target(settings.bitrate_bps, f64::from(framerate));

        let params = SessionParams {
            width: settings.width,
            height: settings.height,
            framerate,
            bitrate_bps: settings.bitrate_bps.max(caps.min_bitrate_bps),
            profile: settings.profile.unwrap_or(caps.profile),
            level_idc: caps.level_idc,
            key_frame_interval: settings.key_frame_interval.max(1),
            input,
        };
        let context = DeliveryContext {
            ledger: Arc::clone(&self.ledger),
            rate: Arc::clone(&self.rate),
            sink: Arc::clone(&self.sink),
            stats: Arc::clone(&self.stats),
            content_type: settings.content_type,
        };
        self.session.configure(params, context)?;
        self.stats.sessions_configured.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drain and free the session. Idempotent; after it, `encode` fails
    /// with [`EncodeError::Uninitialized`] until the next `configure`.
    pub fn release(&mut self) {
        self.settings = None;
        if self.session.release() {
            self.stats.releases.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Submit one raw frame. `frame_type` forces a key frame
    /// (`Some(Key)`) or skips the frame (`Some(Empty)`).
    ///
    /// A frame whose geometry differs from the session's triggers a
    /// synchronous release and configure before it is queued.
    ///
    /// # Errors
    ///
    /// - [`EncodeError::Uninitialized`] without a sink or a session.
    /// - [`EncodeError::ResourceExhausted`] when every input slot is busy.
    /// - [`EncodeError::InvalidFrame`] when the frame cannot be fed.
    /// - [`EncodeError::Device`] when the device fails.
    pub fn encode(
        &mut self,
        frame: &RawFrame,
        frame_type: Option<FrameType>,
    ) -> Result<(), EncodeError> {
        if !self.has_sink.load(Ordering::Acquire) {
            return Err(EncodeError::Uninitialized("no sink registered"));
        }
        let Some(settings) = self.settings.clone() else {
            return Err(EncodeError::Uninitialized("encoder not configured"));
        };
        let Some(params) = self.session.params() else {
            return Err(EncodeError::Uninitialized("no active session"));
        };
        if frame_type == Some(FrameType::Empty) {
            self.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let (width, height) = (frame.width(), frame.height());
        let input = input_format(frame);
        if !params.same_geometry(width, height, input) {
            if matches!(input, InputFormat::Native { .. })
                && !self.session.capabilities().supports_native_handle
            {
                return Err(EncodeError::InvalidFrame(
                    "backend does not accept native buffers".into(),
                ));
            }
            tracing::info!(
                from_width = params.width,
                from_height = params.height,
                width,
                height,
                ?input,
                "Input geometry changed, reconfiguring"
            );
            let resized = EncoderSettings {
                width,
                height,
                ..settings.clone()
            };
            self.session.release();
            self.stats.releases.fetch_add(1, Ordering::Relaxed);
            self.start_session(&resized, input)?;
        }

        let force_key = frame_type == Some(FrameType::Key);
        if force_key {
            self.session.request_key_frame();
        }
        let adjusted = lock_shared(&self.rate).adjusted_bitrate_bps();
        self.session.apply_rates(adjusted, settings.framerate);

        self.session.submit(frame, force_key)?;
        self.stats.frames_submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Update the target bitrate and framerate. Zero values and calls
    /// without a session are ignored.
    pub fn set_rates(&mut self, bitrate_bps: u32, framerate: u32) {
        if bitrate_bps == 0 || framerate == 0 {
            tracing::debug!(bitrate_bps, framerate, "Ignoring zero rate update");
            return;
        }
        let Some(settings) = self.settings.as_mut() else {
            tracing::debug!("Rate update without a session, ignoring");
            return;
        };
        settings.bitrate_bps = bitrate_bps;
        settings.framerate = framerate;

        let (width, height) = self
            .session
            .params()
            .map_or((settings.width, settings.height), |p| (p.width, p.height));
        let capped = self
            .session
            .capabilities()
            .framerate_cap
            .limit(width, height)
            .min(framerate);
        let adjusted = {
            let mut rate = lock_shared(&self.rate);
            rate.set_target(bitrate_bps, f64::from(capped));
            rate.adjusted_bitrate_bps()
        };
        self.session.apply_rates(adjusted, framerate);
    }

    #[must_use]
    pub fn describe_capabilities(&self) -> EncoderCapabilities {
        self.session.capabilities()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Current bitrate the rate adjuster would push.
    #[must_use]
    pub fn adjusted_bitrate_bps(&self) -> u32 {
        lock_shared(&self.rate).adjusted_bitrate_bps()
    }

    /// Smoothed size of delivered units, once any were delivered.
    #[must_use]
    pub fn estimated_frame_bytes(&self) -> Option<f64> {
        lock_shared(&self.rate).estimated_frame_bytes()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.release();
    }
}

fn input_format(frame: &RawFrame) -> InputFormat {
    match &frame.buffer {
        FrameBuffer::I420(_) => InputFormat::I420,
        FrameBuffer::Native(native) => InputFormat::Native {
            format: native.format,
            raw_width: native.raw_width,
            raw_height: native.raw_height,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::loopback::{LoopbackEncoder, LoopbackOptions, LoopbackProfile};
    use crate::delivery::EncodedUnit;
    use crate::frame::I420Buffer;
    use crate::SinkError;

    fn pipeline() -> Pipeline {
        let backend = LoopbackEncoder::new(LoopbackOptions::new(LoopbackProfile::Jetson));
        Pipeline::new(Box::new(backend), PipelineOptions::default()).unwrap()
    }

    fn settings() -> EncoderSettings {
        EncoderSettings {
            width: 64,
            height: 48,
            bitrate_bps: 1_000_000,
            framerate: 30,
            key_frame_interval: 30,
            content_type: ContentType::Unspecified,
            profile: None,
        }
    }

    fn ignore(_: &EncodedUnit<'_>) -> Result<(), SinkError> {
        Ok(())
    }

    fn frame(ts: u64) -> RawFrame {
        RawFrame::new(FrameBuffer::I420(I420Buffer::filled(64, 48, 90)), ts)
    }

    #[test]
    fn encode_requires_sink_then_session() {
        let mut p = pipeline();
        assert!(matches!(
            p.encode(&frame(1), None),
            Err(EncodeError::Uninitialized("no sink registered"))
        ));
        p.register_sink(ignore);
        assert!(matches!(
            p.encode(&frame(1), None),
            Err(EncodeError::Uninitialized("encoder not configured"))
        ));
    }

    #[test]
    fn empty_frame_is_skipped() {
        let mut p = pipeline();
        p.register_sink(ignore);
        p.configure(&settings()).unwrap();
        p.encode(&frame(1), Some(FrameType::Empty)).unwrap();
        let stats = p.stats();
        assert_eq!(stats.frames_skipped, 1);
        assert_eq!(stats.frames_submitted, 0);
    }

    #[test]
    fn out_of_range_resolution_is_rejected() {
        let mut p = pipeline();
        let err = p
            .configure(&EncoderSettings {
                width: 8192,
                ..settings()
            })
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(p.state(), SessionState::Uninitialized);
    }

    #[test]
    fn set_rates_updates_target() {
        let mut p = pipeline();
        p.set_rates(2_000_000, 30);
        assert_eq!(p.adjusted_bitrate_bps(), 0);

        p.configure(&settings()).unwrap();
        p.set_rates(2_000_000, 30);
        assert_eq!(p.adjusted_bitrate_bps(), 1_900_000);
        p.set_rates(0, 30);
        assert_eq!(p.adjusted_bitrate_bps(), 1_900_000);
    }

    #[test]
    fn capabilities_report_backend() {
        let caps = pipeline().describe_capabilities();
        assert_eq!(caps.qp_thresholds.low, 34);
        assert_eq!(caps.qp_thresholds.high, 40);
        assert_eq!(caps.min_bitrate_bps, 300_000);
    }

    #[test]
    fn release_counts_once() {
        let mut p = pipeline();
        p.configure(&settings()).unwrap();
        p.release();
        p.release();
        assert_eq!(p.stats().releases, 1);
        assert_eq!(p.stats().sessions_configured, 1);
    }
}
