//! Hardware encoder backends.
//!
//! A backend owns the device handles and its completion threads. It never
//! calls the consumer directly: finished output travels as
//! [`CompletionEvent`]s to the delivery loop, and input buffers travel back
//! over the return channel handed out by [`HardwareEncoder::configure`].

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::frame::NativeFormat;
use crate::platform::PlatformHooks;
use crate::queue::DeviceBuffer;
use crate::rate::FramerateCap;
use crate::EncodeError;

#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod loopback;

/// Minimum bitrate any supported device accepts.
pub const MIN_BITRATE_BPS: u32 = 300_000;

/// Which backend to drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// In-process device model, GPU/V4L2 behaviour.
    #[default]
    Loopback,
    /// In-process device model, VideoCore behaviour.
    LoopbackVideocore,
    /// `nvv4l2h264enc` through GStreamer.
    Jetson,
    /// `v4l2h264enc` through GStreamer.
    Videocore,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loopback => write!(f, "loopback"),
            Self::LoopbackVideocore => write!(f, "loopback (VideoCore)"),
            Self::Jetson => write!(f, "Jetson (nvv4l2h264enc)"),
            Self::Videocore => write!(f, "VideoCore (v4l2h264enc)"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loopback" => Ok(Self::Loopback),
            "loopback-videocore" => Ok(Self::LoopbackVideocore),
            "jetson" => Ok(Self::Jetson),
            "videocore" => Ok(Self::Videocore),
            other => Err(format!(
                "unknown backend {other:?} (expected loopback, loopback-videocore, jetson or videocore)"
            )),
        }
    }
}

/// Instantiate the backend for `kind`.
///
/// # Errors
///
/// [`EncodeError::BackendUnavailable`] when a GStreamer backend is requested
/// in a build without the `gstreamer` feature.
pub fn create(kind: BackendKind) -> Result<Box<dyn HardwareEncoder>, EncodeError> {
    use loopback::{LoopbackEncoder, LoopbackOptions, LoopbackProfile};

    match kind {
        BackendKind::Loopback => Ok(Box::new(LoopbackEncoder::new(
            LoopbackOptions::new(LoopbackProfile::Jetson),
        ))),
        BackendKind::LoopbackVideocore => Ok(Box::new(LoopbackEncoder::new(
            LoopbackOptions::new(LoopbackProfile::VideoCore),
        ))),
        #[cfg(feature = "gstreamer")]
        BackendKind::Jetson => Ok(Box::new(gst::GstHwEncoder::new(gst::GstTarget::Jetson))),
        #[cfg(feature = "gstreamer")]
        BackendKind::Videocore => Ok(Box::new(gst::GstHwEncoder::new(gst::GstTarget::VideoCore))),
        #[cfg(not(feature = "gstreamer"))]
        BackendKind::Jetson => Err(EncodeError::BackendUnavailable("jetson")),
        #[cfg(not(feature = "gstreamer"))]
        BackendKind::Videocore => Err(EncodeError::BackendUnavailable("videocore")),
    }
}

/// H.264 profile negotiated with the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Baseline,
    Main,
    #[default]
    High,
}

impl Profile {
    #[must_use]
    pub fn profile_idc(self) -> u8 {
        match self {
            Self::Baseline => 66,
            Self::Main => 77,
            Self::High => 100,
        }
    }

    /// Name as used by V4L2/GStreamer controls.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Main => "main",
            Self::High => "high",
        }
    }
}

/// QP bounds used by the caller's quality scaler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpThresholds {
    /// Below this the stream has room to scale resolution up.
    pub low: u8,
    /// Above this the stream should scale down.
    pub high: u8,
}

impl Default for QpThresholds {
    fn default() -> Self {
        Self { low: 34, high: 40 }
    }
}

/// What a backend can do, reported through `describe_capabilities`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCapabilities {
    pub implementation_name: &'static str,
    pub hardware_accelerated: bool,
    /// Accepts opaque device-native capture buffers.
    pub supports_native_handle: bool,
    pub min_resolution: (u32, u32),
    pub max_resolution: (u32, u32),
    pub qp_thresholds: QpThresholds,
    pub framerate_cap: FramerateCap,
    pub min_bitrate_bps: u32,
    pub profile: Profile,
    /// `level_idc`, e.g. 51 for level 5.1.
    pub level_idc: u8,
}

impl EncoderCapabilities {
    /// Whether `width`x`height` is inside the supported range.
    #[must_use]
    pub fn supports_resolution(&self, width: u32, height: u32) -> bool {
        (self.min_resolution.0..=self.max_resolution.0).contains(&width)
            && (self.min_resolution.1..=self.max_resolution.1).contains(&height)
    }
}

/// Shape of the frames fed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// Planar I420 written by the CPU.
    I420,
    /// Opaque capture buffers converted on the device first.
    Native {
        format: NativeFormat,
        raw_width: u32,
        raw_height: u32,
    },
}

/// Everything a backend needs to negotiate one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate_bps: u32,
    pub profile: Profile,
    pub level_idc: u8,
    /// Frames between IDRs; also the I-frame interval.
    pub key_frame_interval: u32,
    pub input: InputFormat,
}

impl SessionParams {
    /// Whether a frame of this geometry needs a new session.
    #[must_use]
    pub fn same_geometry(&self, width: u32, height: u32, input: InputFormat) -> bool {
        self.width == width && self.height == height && self.input == input
    }
}

/// Buffers and channels of a freshly configured session.
pub struct DeviceQueues {
    /// Input slots, all application-owned.
    pub input: Vec<DeviceBuffer>,
    /// Consumed input buffers coming back from the device.
    pub input_returns: Receiver<DeviceBuffer>,
    /// Output slots; the session queues them all before streaming.
    pub output: Vec<DeviceBuffer>,
    /// Hands output buffers (back) to the device.
    pub output_recycle: Sender<DeviceBuffer>,
}

/// Message from a device completion thread to the delivery loop.
#[derive(Debug)]
pub enum CompletionEvent {
    /// A filled output buffer, carrying the echoed capture timestamp.
    Output(DeviceBuffer),
    /// The device flushed everything after an end-of-stream request.
    EndOfStream,
    /// Asynchronous device failure.
    Error(String),
}

/// Runtime rate change. `None` fields are left as they are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateUpdate {
    pub bitrate_bps: Option<u32>,
    pub framerate: Option<u32>,
}

/// Polymorphic hardware encoder.
///
/// All methods are called from the submission thread, except that
/// completions flow out through the channels set up by `configure`.
pub trait HardwareEncoder: Send {
    fn capabilities(&self) -> EncoderCapabilities;

    /// Process-wide init/teardown this backend needs, if any.
    fn platform(&self) -> Option<PlatformHooks>;

    /// Negotiate a session and allocate its buffers.
    ///
    /// Completion events for the session go to `completions`.
    ///
    /// # Errors
    ///
    /// [`EncodeError::Device`] if any negotiation step fails. The caller
    /// then calls [`release`](Self::release).
    fn configure(
        &mut self,
        params: &SessionParams,
        completions: Sender<CompletionEvent>,
    ) -> Result<DeviceQueues, EncodeError>;

    /// Queue a filled input buffer. Its `timestamp_us` is echoed on the
    /// matching output.
    ///
    /// # Errors
    ///
    /// [`EncodeError::Device`] if the device refused the buffer.
    fn encode(&mut self, buffer: DeviceBuffer) -> Result<(), EncodeError>;

    /// # Errors
    ///
    /// [`EncodeError::Device`] if the device rejected the control.
    fn set_rates(&mut self, update: RateUpdate) -> Result<(), EncodeError>;

    /// Make the next encoded frame an IDR.
    ///
    /// # Errors
    ///
    /// [`EncodeError::Device`] if the request could not be delivered.
    fn request_key_frame(&mut self) -> Result<(), EncodeError>;

    /// Ask the device to flush and emit [`CompletionEvent::EndOfStream`].
    ///
    /// # Errors
    ///
    /// [`EncodeError::Device`] if the request could not be delivered.
    fn send_end_of_stream(&mut self) -> Result<(), EncodeError>;

    /// Tear the session down and free its device resources. Idempotent.
    fn release(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_from_config_names() {
        #[derive(Deserialize)]
        struct Wrap {
            backend: BackendKind,
        }
        let w: Wrap = toml::from_str("backend = \"loopback-videocore\"").unwrap();
        assert_eq!(w.backend, BackendKind::LoopbackVideocore);
        let w: Wrap = toml::from_str("backend = \"jetson\"").unwrap();
        assert_eq!(w.backend, BackendKind::Jetson);
        assert_eq!("videocore".parse(), Ok(BackendKind::Videocore));
        assert!("vaapi".parse::<BackendKind>().is_err());
    }

    #[cfg(not(feature = "gstreamer"))]
    #[test]
    fn gstreamer_backends_unavailable_without_feature() {
        assert!(matches!(
            create(BackendKind::Jetson),
            Err(EncodeError::BackendUnavailable("jetson"))
        ));
        assert!(create(BackendKind::Loopback).is_ok());
    }

    #[test]
    fn geometry_comparison_includes_input_format() {
        let params = SessionParams {
            width: 640,
            height: 480,
            framerate: 30,
            bitrate_bps: 1_000_000,
            profile: Profile::High,
            level_idc: 51,
            key_frame_interval: 3000,
            input: InputFormat::I420,
        };
        assert!(params.same_geometry(640, 480, InputFormat::I420));
        assert!(!params.same_geometry(
            640,
            480,
            InputFormat::Native {
                format: NativeFormat::Mjpeg,
                raw_width: 1280,
                raw_height: 720
            }
        ));
        assert!(!params.same_geometry(1280, 720, InputFormat::I420));
    }
}
