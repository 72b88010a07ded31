//! `GStreamer` hardware encoder backends.
//!
//! Pipeline: `appsrc ! [jpegdec] ! scaler ! capsfilter ! encoder ! capsfilter ! h264parse ! appsink`
//!
//! The Jetson target uses `nvvidconv` and `nvv4l2h264enc`, the VideoCore
//! target `videoconvert`/`videoscale` and `v4l2h264enc`. Input slots are
//! lent to `appsrc` without copying and come back when `GStreamer` frees
//! the wrapping buffer. Encoded samples are copied into recycled output
//! slots on the streaming thread and posted as completion events.

use std::str::FromStr;

use crossbeam_channel::{unbounded, Receiver, Sender};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use super::{
    CompletionEvent, DeviceQueues, EncoderCapabilities, HardwareEncoder, InputFormat,
    QpThresholds, RateUpdate, SessionParams, MIN_BITRATE_BPS,
};
use crate::bitstream::{frame_access_unit, NAL_IDR, NAL_SLICE};
use crate::frame::NativeFormat;
use crate::platform::PlatformHooks;
use crate::queue::{DeviceBuffer, Plane};
use crate::rate::FramerateCap;
use crate::EncodeError;

/// Output slot size; large enough for an IDR at the highest supported rate.
const OUTPUT_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Hardware family driven through `GStreamer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GstTarget {
    /// NVIDIA Jetson: `nvvidconv ! nvv4l2h264enc`.
    Jetson,
    /// Raspberry Pi VideoCore: `videoscale ! v4l2h264enc`.
    VideoCore,
}

impl GstTarget {
    /// `GStreamer` element factory name of the encoder.
    #[must_use]
    pub fn element_name(self) -> &'static str {
        match self {
            Self::Jetson => "nvv4l2h264enc",
            Self::VideoCore => "v4l2h264enc",
        }
    }

    fn slots(self) -> (usize, usize) {
        match self {
            Self::Jetson => (10, 10),
            Self::VideoCore => (1, 4),
        }
    }

    fn alignment(self) -> (u32, u32) {
        match self {
            Self::Jetson => (32, 2),
            Self::VideoCore => (32, 16),
        }
    }
}

impl std::fmt::Display for GstTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Jetson => write!(f, "Jetson"),
            Self::VideoCore => write!(f, "VideoCore"),
        }
    }
}

/// Check if a `GStreamer` element factory is available.
#[must_use]
pub fn is_element_available(element_name: &str) -> bool {
    gst::ElementFactory::find(element_name).is_some()
}

struct Running {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    encoder: gst::Element,
    returns: Sender<DeviceBuffer>,
    params: SessionParams,
}

/// H.264 hardware encoder behind a `GStreamer` pipeline.
pub struct GstHwEncoder {
    target: GstTarget,
    running: Option<Running>,
}

impl GstHwEncoder {
    #[must_use]
    pub fn new(target: GstTarget) -> Self {
        Self {
            target,
            running: None,
        }
    }

    fn running(&self) -> Result<&Running, EncodeError> {
        self.running
            .as_ref()
            .ok_or(EncodeError::Uninitialized("no gstreamer session"))
    }
}

fn gst_init() -> Result<(), EncodeError> {
    gst::init().map_err(|e| EncodeError::device("gstreamer init", e.to_string()))
}

fn gst_teardown() {
    // gst_deinit is unsafe while any GStreamer object may still be alive.
    tracing::debug!("GStreamer stays loaded until process exit");
}

impl HardwareEncoder for GstHwEncoder {
    fn capabilities(&self) -> EncoderCapabilities {
        match self.target {
            GstTarget::Jetson => EncoderCapabilities {
                implementation_name: "nvv4l2h264enc",
                hardware_accelerated: true,
                supports_native_handle: true,
                min_resolution: (16, 16),
                max_resolution: (4096, 4096),
                qp_thresholds: QpThresholds::default(),
                framerate_cap: FramerateCap::GPU,
                min_bitrate_bps: MIN_BITRATE_BPS,
                profile: super::Profile::High,
                level_idc: 51,
            },
            GstTarget::VideoCore => EncoderCapabilities {
                implementation_name: "v4l2h264enc",
                hardware_accelerated: true,
                supports_native_handle: true,
                min_resolution: (16, 16),
                max_resolution: (1920, 1920),
                qp_thresholds: QpThresholds::default(),
                framerate_cap: FramerateCap::Fixed(30),
                min_bitrate_bps: MIN_BITRATE_BPS,
                profile: super::Profile::High,
                level_idc: 42,
            },
        }
    }

    fn platform(&self) -> Option<PlatformHooks> {
        Some(PlatformHooks {
            name: "gstreamer",
            init: gst_init,
            teardown: gst_teardown,
        })
    }

    fn configure(
        &mut self,
        params: &SessionParams,
        completions: Sender<CompletionEvent>,
    ) -> Result<DeviceQueues, EncodeError> {
        self.release();

        let element = self.target.element_name();
        if !is_element_available(element) {
            return Err(EncodeError::device(
                "find encoder",
                format!("{element} is not installed"),
            ));
        }

        let (pipeline, appsrc, appsink, encoder) = build_pipeline(self.target, params)?;
        let (recycle_tx, recycle_rx) = unbounded();
        let (returns_tx, returns_rx) = unbounded();
        install_callbacks(&appsink, recycle_rx, completions);

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(EncodeError::device("start pipeline", e.to_string()));
        }

        let (input_slots, output_slots) = self.target.slots();
        let (align_w, align_h) = self.target.alignment();
        let input_planes = match params.input {
            InputFormat::I420 => Plane::i420(params.width, params.height, align_w, align_h),
            InputFormat::Native {
                raw_width,
                raw_height,
                ..
            } => Plane::bytes(raw_width as usize * raw_height as usize * 3 / 2),
        };
        let input = (0..input_slots)
            .map(|i| DeviceBuffer::allocate(i, input_planes.clone()))
            .collect();
        let output = (0..output_slots)
            .map(|i| DeviceBuffer::allocate(i, Plane::bytes(OUTPUT_BUFFER_SIZE)))
            .collect();

        tracing::info!(
            encoder = self.target.element_name(),
            width = params.width,
            height = params.height,
            bitrate = params.bitrate_bps,
            framerate = params.framerate,
            "GStreamer encoder pipeline playing"
        );
        self.running = Some(Running {
            pipeline,
            appsrc,
            encoder,
            returns: returns_tx,
            params: params.clone(),
        });

        Ok(DeviceQueues {
            input,
            input_returns: returns_rx,
            output,
            output_recycle: recycle_tx,
        })
    }

    fn encode(&mut self, buffer: DeviceBuffer) -> Result<(), EncodeError> {
        let running = self.running()?;
        if buffer.flags.force_key_frame {
            force_key_unit(&running.encoder);
        }

        let timestamp_us = buffer.timestamp_us;
        let planes = buffer.planes().to_vec();
        let mut gst_buffer = gst::Buffer::from_mut_slice(ReturnOnDrop {
            buffer,
            returns: running.returns.clone(),
        });
        {
            let buffer_ref = gst_buffer
                .get_mut()
                .ok_or_else(|| EncodeError::device("wrap input", "buffer is shared"))?;
            buffer_ref.set_pts(gst::ClockTime::from_useconds(timestamp_us));
            if running.params.input == InputFormat::I420 {
                add_video_meta(buffer_ref, &running.params, &planes)?;
            }
        }

        running
            .appsrc
            .push_buffer(gst_buffer)
            .map_err(|e| EncodeError::device("push input", e.to_string()))?;
        Ok(())
    }

    fn set_rates(&mut self, update: RateUpdate) -> Result<(), EncodeError> {
        let target = self.target;
        let running = self.running()?;
        if let Some(bitrate) = update.bitrate_bps {
            match target {
                GstTarget::Jetson => set_if_present(&running.encoder, "bitrate", &bitrate.to_string()),
                GstTarget::VideoCore => set_if_present(
                    &running.encoder,
                    "extra-controls",
                    &format!("controls,video_bitrate={bitrate}"),
                ),
            }
            tracing::debug!(bitrate, "Encoder bitrate updated");
        }
        if let Some(framerate) = update.framerate {
            let params = SessionParams {
                framerate,
                ..running.params.clone()
            };
            running.appsrc.set_caps(Some(&source_caps(&params)?));
            tracing::debug!(framerate, "Source framerate updated");
        }
        Ok(())
    }

    fn request_key_frame(&mut self) -> Result<(), EncodeError> {
        force_key_unit(&self.running()?.encoder);
        Ok(())
    }

    fn send_end_of_stream(&mut self) -> Result<(), EncodeError> {
        self.running()?
            .appsrc
            .end_of_stream()
            .map_err(|e| EncodeError::device("end of stream", e.to_string()))?;
        Ok(())
    }

    fn release(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.pipeline.set_state(gst::State::Null);
            tracing::info!(encoder = self.target.element_name(), "Encoder pipeline stopped");
        }
    }
}

impl Drop for GstHwEncoder {
    fn drop(&mut self) {
        self.release();
    }
}

/// Gives an input slot back to the session once `GStreamer` frees it.
struct ReturnOnDrop {
    buffer: DeviceBuffer,
    returns: Sender<DeviceBuffer>,
}

impl AsMut<[u8]> for ReturnOnDrop {
    fn as_mut(&mut self) -> &mut [u8] {
        self.buffer.filled_mut()
    }
}

impl Drop for ReturnOnDrop {
    fn drop(&mut self) {
        let buffer = std::mem::replace(&mut self.buffer, DeviceBuffer::detached());
        // The session is gone when this fails; the slot dies with it.
        let _ = self.returns.send(buffer);
    }
}

fn force_key_unit(encoder: &gst::Element) {
    let event = gst_video::UpstreamForceKeyUnitEvent::builder()
        .all_headers(true)
        .build();
    encoder.send_event(event);
    tracing::debug!("Forced keyframe requested");
}

fn add_video_meta(
    buffer: &mut gst::BufferRef,
    params: &SessionParams,
    planes: &[Plane],
) -> Result<(), EncodeError> {
    let offsets: Vec<usize> = planes.iter().map(|p| p.offset).collect();
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    let strides: Vec<i32> = planes.iter().map(|p| p.stride as i32).collect();
    gst_video::VideoMeta::add_full(
        buffer,
        gst_video::VideoFrameFlags::empty(),
        gst_video::VideoFormat::I420,
        params.width,
        params.height,
        &offsets,
        &strides,
    )
    .map_err(|e| EncodeError::device("attach video meta", e.to_string()))?;
    Ok(())
}

/// Copy each encoded sample into a recycled output slot and post it.
fn install_callbacks(
    appsink: &gst_app::AppSink,
    recycle: Receiver<DeviceBuffer>,
    completions: Sender<CompletionEvent>,
) {
    let eos_completions = completions.clone();
    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                // Blocks until the delivery loop hands a slot back; fails
                // once the session has stopped.
                let mut out = recycle.recv().map_err(|_| gst::FlowError::Flushing)?;
                out.reset();
                if let Err(e) = out.write_payload(&map) {
                    let _ = completions.send(CompletionEvent::Error(e.to_string()));
                }
                out.timestamp_us = buffer.pts().map_or(0, gst::ClockTime::useconds);
                out.flags.key_frame = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
                out.flags.codec_config = buffer.flags().contains(gst::BufferFlags::HEADER)
                    && !frame_access_unit(out.filled())
                        .units
                        .iter()
                        .any(|u| matches!(u.nal_type, NAL_SLICE | NAL_IDR));

                completions
                    .send(CompletionEvent::Output(out))
                    .map_err(|_| gst::FlowError::Flushing)?;
                Ok(gst::FlowSuccess::Ok)
            })
            .eos(move |_| {
                let _ = eos_completions.send(CompletionEvent::EndOfStream);
            })
            .build(),
    );
}

#[allow(clippy::cast_possible_wrap)]
fn source_caps(params: &SessionParams) -> Result<gst::Caps, EncodeError> {
    let framerate = gst::Fraction::new(params.framerate as i32, 1);
    let caps = match params.input {
        InputFormat::I420 => gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", params.width as i32)
            .field("height", params.height as i32)
            .field("framerate", framerate)
            .build(),
        InputFormat::Native {
            format: NativeFormat::Mjpeg,
            raw_width,
            raw_height,
        } => gst::Caps::builder("image/jpeg")
            .field("width", raw_width as i32)
            .field("height", raw_height as i32)
            .field("framerate", framerate)
            .build(),
        InputFormat::Native {
            format: NativeFormat::I420,
            raw_width,
            raw_height,
        } => gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", raw_width as i32)
            .field("height", raw_height as i32)
            .field("framerate", framerate)
            .build(),
    };
    if caps.is_empty() {
        return Err(EncodeError::device("build source caps", "empty caps"));
    }
    Ok(caps)
}

/// Build the pipeline for one session.
fn build_pipeline(
    target: GstTarget,
    params: &SessionParams,
) -> Result<(gst::Pipeline, gst_app::AppSrc, gst_app::AppSink, gst::Element), EncodeError> {
    #[allow(clippy::cast_possible_wrap)]
    let (width, height) = (params.width as i32, params.height as i32);

    let pipeline = gst::Pipeline::new();

    let appsrc = gst_app::AppSrc::builder()
        .name("source")
        .caps(&source_caps(params)?)
        .format(gst::Format::Time)
        .is_live(true)
        .build();

    let mut chain: Vec<gst::Element> = Vec::new();
    if let InputFormat::Native {
        format: NativeFormat::Mjpeg,
        ..
    } = params.input
    {
        chain.push(make_element("jpegdec", "decode")?);
    }

    // Scaler: device-native on Jetson, software elsewhere.
    let raw_caps = match target {
        GstTarget::Jetson => {
            chain.push(make_element("nvvidconv", "convert")?);
            gst::Caps::builder("video/x-raw")
                .features(["memory:NVMM"])
                .field("format", "I420")
                .field("width", width)
                .field("height", height)
                .build()
        }
        GstTarget::VideoCore => {
            chain.push(make_element("videoconvert", "convert")?);
            chain.push(make_element("videoscale", "scale")?);
            gst::Caps::builder("video/x-raw")
                .field("format", "I420")
                .field("width", width)
                .field("height", height)
                .build()
        }
    };
    let raw_filter = make_element("capsfilter", "rawcaps")?;
    raw_filter.set_property("caps", raw_caps);
    chain.push(raw_filter);

    let encoder = make_element(target.element_name(), "encoder")?;
    configure_encoder(&encoder, target, params);
    chain.push(encoder.clone());

    // Profile and level are negotiated through the downstream caps.
    let h264_filter = make_element("capsfilter", "h264caps")?;
    h264_filter.set_property(
        "caps",
        gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .field("profile", params.profile.as_str())
            .field("level", level_string(params.level_idc))
            .build(),
    );
    chain.push(h264_filter);

    let h264parse = make_element("h264parse", "parser")?;
    h264parse.set_property("config-interval", -1i32);
    chain.push(h264parse);

    let appsink = gst_app::AppSink::builder()
        .name("sink")
        .caps(
            &gst::Caps::builder("video/x-h264")
                .field("stream-format", "byte-stream")
                .field("alignment", "au")
                .build(),
        )
        .sync(false)
        .build();

    let mut elements: Vec<&gst::Element> = vec![appsrc.upcast_ref()];
    elements.extend(chain.iter());
    elements.push(appsink.upcast_ref());

    pipeline
        .add_many(elements.iter().copied())
        .map_err(|e| EncodeError::device("assemble pipeline", e.to_string()))?;
    gst::Element::link_many(elements.iter().copied())
        .map_err(|e| EncodeError::device("link pipeline", e.to_string()))?;

    tracing::info!(
        %target,
        width = params.width,
        height = params.height,
        input = ?params.input,
        "GStreamer H.264 pipeline built"
    );

    Ok((pipeline, appsrc, appsink, encoder))
}

/// Create a `GStreamer` element by factory name.
fn make_element(factory_name: &str, element_name: &str) -> Result<gst::Element, EncodeError> {
    gst::ElementFactory::make(factory_name)
        .name(element_name)
        .build()
        .map_err(|e| EncodeError::device("create element", format!("{factory_name}: {e}")))
}

/// Set a property from its string form, skipping properties this plugin
/// version does not have.
fn set_if_present(element: &gst::Element, name: &str, value: &str) {
    if element.find_property(name).is_some() {
        element.set_property_from_str(name, value);
    } else {
        tracing::debug!(property = name, "Encoder has no such property, skipping");
    }
}

fn level_string(level_idc: u8) -> String {
    format!("{}.{}", level_idc / 10, level_idc % 10)
}

/// CBR, no B-frames, parameter sets on every IDR.
fn configure_encoder(encoder: &gst::Element, target: GstTarget, params: &SessionParams) {
    let interval = params.key_frame_interval.to_string();
    match target {
        GstTarget::Jetson => {
            set_if_present(encoder, "control-rate", "constant_bitrate");
            set_if_present(encoder, "bitrate", &params.bitrate_bps.to_string());
            set_if_present(encoder, "iframeinterval", &interval);
            set_if_present(encoder, "idrinterval", &interval);
            set_if_present(encoder, "num-B-Frames", "0");
            set_if_present(encoder, "insert-sps-pps", "true");
            set_if_present(encoder, "maxperf-enable", "true");
        }
        GstTarget::VideoCore => {
            let controls = format!(
                "controls,video_bitrate_mode=1,video_bitrate={},h264_i_frame_period={},\
                 video_b_frames=0,repeat_sequence_header=1",
                params.bitrate_bps, params.key_frame_interval
            );
            if gst::Structure::from_str(&controls).is_ok() {
                set_if_present(encoder, "extra-controls", &controls);
            }
        }
    }

    tracing::debug!(
        %target,
        bitrate = params.bitrate_bps,
        key_frame_interval = params.key_frame_interval,
        profile = params.profile.as_str(),
        level = params.level_idc,
        "Encoder configured"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Profile;

    #[test]
    fn level_strings() {
        assert_eq!(level_string(51), "5.1");
        assert_eq!(level_string(42), "4.2");
    }

    #[test]
    fn targets_report_platform_caps() {
        let jetson = GstHwEncoder::new(GstTarget::Jetson).capabilities();
        assert_eq!(jetson.level_idc, 51);
        assert_eq!(jetson.framerate_cap.limit(1920, 1080), 60);
        let vc = GstHwEncoder::new(GstTarget::VideoCore).capabilities();
        assert_eq!(vc.level_idc, 42);
        assert_eq!(vc.framerate_cap.limit(640, 480), 30);
    }

    #[test]
    fn encode_without_session_is_uninitialized() {
        let mut encoder = GstHwEncoder::new(GstTarget::VideoCore);
        assert!(matches!(
            encoder.encode(DeviceBuffer::detached()),
            Err(EncodeError::Uninitialized(_))
        ));
        encoder.release();
    }

    #[test]
    fn missing_encoder_element_fails_configure() {
        gst_init().unwrap();
        assert!(!is_element_available("hwenc-no-such-element"));

        let target = GstTarget::Jetson;
        if is_element_available(target.element_name()) {
            return;
        }
        let (tx, _rx) = unbounded();
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
        let mut encoder = GstHwEncoder::new(target);
        assert!(matches!(
            encoder.configure(&params, tx),
            Err(EncodeError::Device { stage: "find encoder", .. })
        ));
    }
}
