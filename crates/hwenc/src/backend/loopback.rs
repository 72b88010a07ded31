//! In-process device model.
//!
//! Behaves like the real queue-based encoders: fixed input and output
//! rings, a driver thread that consumes input on its own schedule, output
//! that only flows while the application keeps recycling buffers, and a
//! converter stage chained in front of the encoder for native input. The
//! byte stream it emits is syntactically valid H.264 (parameter sets plus
//! one slice header per frame with filler slice data), so framing and QP
//! extraction run on it unchanged. Pixels are never compressed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{select, unbounded, Receiver, Sender};

use super::{
    CompletionEvent, DeviceQueues, EncoderCapabilities, HardwareEncoder, InputFormat,
    Profile, QpThresholds, RateUpdate, SessionParams, MIN_BITRATE_BPS,
};
use crate::bitstream::rbsp::{escape, BitWriter};
use crate::platform::PlatformHooks;
use crate::queue::{DeviceBuffer, HandoffPool, Plane};
use crate::rate::FramerateCap;
use crate::EncodeError;

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const SLICE_FILLER: u8 = 0x5A;

/// Which device the model imitates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackProfile {
    /// V4L2 encoder on a GPU SoC: parameter sets inline in IDR access
    /// units, 60 fps up to 1080p.
    Jetson,
    /// VideoCore: parameter sets in separate codec-config buffers, 30 fps.
    VideoCore,
}

/// How large each synthetic access unit is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSizing {
    /// Every access unit is exactly this many bytes (when large enough to
    /// hold its headers).
    Fixed(usize),
    /// Bitrate divided by framerate; IDRs are three times larger.
    FollowBitrate,
}

/// Knobs of the device model.
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub profile: LoopbackProfile,
    pub input_slots: usize,
    pub output_slots: usize,
    pub output_buffer_size: usize,
    pub frame_sizing: FrameSizing,
    /// Capture timestamps the device silently drops.
    pub drop_timestamps: Vec<u64>,
    /// Emit an IDR for the first frame of every session.
    pub leading_idr: bool,
    /// Never acknowledge end-of-stream (simulates a hung device).
    pub stall_on_eos: bool,
    /// Fail format negotiation.
    pub fail_configure: bool,
    /// Time the driver thread spends per frame.
    pub process_delay: Duration,
}

impl LoopbackOptions {
    /// Defaults matching the buffer counts of the modelled device.
    #[must_use]
    pub fn new(profile: LoopbackProfile) -> Self {
        let (input_slots, output_slots) = match profile {
            LoopbackProfile::Jetson => (10, 10),
            LoopbackProfile::VideoCore => (1, 4),
        };
        Self {
            profile,
            input_slots,
            output_slots,
            output_buffer_size: 1 << 20,
            frame_sizing: FrameSizing::FollowBitrate,
            drop_timestamps: Vec::new(),
            leading_idr: true,
            stall_on_eos: false,
            fail_configure: false,
            process_delay: Duration::ZERO,
        }
    }
}

/// Counters observed from outside the device.
#[derive(Debug, Default)]
pub struct LoopbackStats {
    pub configures: AtomicUsize,
    pub releases: AtomicUsize,
    pub frames_in: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    pub frames_converted: AtomicUsize,
    pub key_requests: AtomicUsize,
    bitrates: Mutex<Vec<u32>>,
    framerates: Mutex<Vec<u32>>,
    sessions: Mutex<Vec<SessionParams>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| {
        tracing::warn!("loopback mutex was poisoned, recovering");
        e.into_inner()
    })
}

impl LoopbackStats {
    /// Bitrates pushed with `set_rates`, in order.
    #[must_use]
    pub fn bitrate_updates(&self) -> Vec<u32> {
        lock(&self.bitrates).clone()
    }

    /// Framerates pushed with `set_rates`, in order.
    #[must_use]
    pub fn framerate_updates(&self) -> Vec<u32> {
        lock(&self.framerates).clone()
    }

    /// Parameters of every successful `configure`, in order.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionParams> {
        lock(&self.sessions).clone()
    }

    fn count(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Controls {
    bitrate_bps: u32,
    framerate: u32,
    force_key: bool,
}

enum Job {
    Frame(DeviceBuffer),
    EndOfStream,
}

/// Where a consumed input buffer goes back to.
enum ReturnPath {
    Input(Sender<DeviceBuffer>),
    Pool(Arc<HandoffPool>),
}

impl ReturnPath {
    fn give_back(&self, buffer: DeviceBuffer) {
        match self {
            Self::Input(tx) => {
                let _ = tx.send(buffer);
            }
            Self::Pool(pool) => pool.put(buffer),
        }
    }
}

struct Running {
    submit: Sender<Job>,
    shutdown: Sender<()>,
    pool: Option<Arc<HandoffPool>>,
    controls: Arc<Mutex<Controls>>,
    threads: Vec<JoinHandle<()>>,
}

/// [`HardwareEncoder`] backed by the device model.
pub struct LoopbackEncoder {
    options: LoopbackOptions,
    stats: Arc<LoopbackStats>,
    running: Option<Running>,
}

impl LoopbackEncoder {
    #[must_use]
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            options,
            stats: Arc::new(LoopbackStats::default()),
            running: None,
        }
    }

    /// Shared handle to the counters; stays valid after the encoder moves
    /// into a pipeline.
    #[must_use]
    pub fn stats(&self) -> Arc<LoopbackStats> {
        Arc::clone(&self.stats)
    }

    fn alignment(&self) -> (u32, u32) {
        match self.options.profile {
            LoopbackProfile::Jetson => (32, 2),
            LoopbackProfile::VideoCore => (32, 16),
        }
    }

    fn running(&self, stage: &'static str) -> Result<&Running, EncodeError> {
        self.running
            .as_ref()
            .ok_or(EncodeError::Uninitialized(stage))
    }
}

fn noop_init() -> Result<(), EncodeError> {
    Ok(())
}

fn noop_teardown() {}

impl HardwareEncoder for LoopbackEncoder {
    fn capabilities(&self) -> EncoderCapabilities {
        match self.options.profile {
            LoopbackProfile::Jetson => EncoderCapabilities {
                implementation_name: "loopback (Jetson model)",
                hardware_accelerated: false,
                supports_native_handle: true,
                min_resolution: (16, 16),
                max_resolution: (4096, 4096),
                qp_thresholds: QpThresholds::default(),
                framerate_cap: FramerateCap::GPU,
                min_bitrate_bps: MIN_BITRATE_BPS,
                profile: Profile::High,
                level_idc: 51,
            },
            LoopbackProfile::VideoCore => EncoderCapabilities {
                implementation_name: "loopback (VideoCore model)",
                hardware_accelerated: false,
                supports_native_handle: true,
                min_resolution: (16, 16),
                max_resolution: (1920, 1920),
                qp_thresholds: QpThresholds::default(),
                framerate_cap: FramerateCap::Fixed(30),
                min_bitrate_bps: MIN_BITRATE_BPS,
                profile: Profile::High,
                level_idc: 42,
            },
        }
    }

    fn platform(&self) -> Option<PlatformHooks> {
        Some(PlatformHooks {
            name: "loopback",
            init: noop_init,
            teardown: noop_teardown,
        })
    }

    fn configure(
        &mut self,
        params: &SessionParams,
        completions: Sender<CompletionEvent>,
    ) -> Result<DeviceQueues, EncodeError> {
        if self.running.is_some() {
            return Err(EncodeError::device("configure", "session already active"));
        }
        if self.options.fail_configure {
            return Err(EncodeError::device("set capture plane format", "injected failure"));
        }
        if !self.capabilities().supports_resolution(params.width, params.height) {
            return Err(EncodeError::device(
                "set output plane format",
                format!("unsupported resolution {}x{}", params.width, params.height),
            ));
        }
        if self.options.input_slots == 0 || self.options.output_slots == 0 {
            return Err(EncodeError::device("request buffers", "zero buffers requested"));
        }

        let (align_w, align_h) = self.alignment();
        let input_layout = match params.input {
            InputFormat::I420 => Plane::i420(params.width, params.height, align_w, align_h),
            InputFormat::Native {
                raw_width,
                raw_height,
                ..
            } => {
                let w = raw_width.next_multiple_of(align_w) as usize;
                let h = raw_height.next_multiple_of(align_h) as usize;
                Plane::bytes(w * h * 2)
            }
        };
        let input: Vec<DeviceBuffer> = (0..self.options.input_slots)
            .map(|i| DeviceBuffer::allocate(i, input_layout.clone()))
            .collect();
        let output: Vec<DeviceBuffer> = (0..self.options.output_slots)
            .map(|i| DeviceBuffer::allocate(i, Plane::bytes(self.options.output_buffer_size)))
            .collect();

        let (returns_tx, returns_rx) = unbounded();
        let (recycle_tx, recycle_rx) = unbounded();
        let (submit_tx, submit_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();
        let controls = Arc::new(Mutex::new(Controls {
            bitrate_bps: params.bitrate_bps,
            framerate: params.framerate,
            force_key: false,
        }));

        let mut threads = Vec::new();
        let mut pool = None;
        let (encoder_jobs, encoder_returns) = if let InputFormat::Native { .. } = params.input {
            let intermediate = Plane::i420(params.width, params.height, align_w, align_h);
            let handoff = Arc::new(HandoffPool::new(
                (0..self.options.input_slots)
                    .map(|i| DeviceBuffer::allocate(i, intermediate.clone()))
                    .collect(),
            ));
            let (forward_tx, forward_rx) = unbounded();
            let converter = Converter {
                jobs: submit_rx,
                forward: forward_tx,
                returns: returns_tx,
                pool: Arc::clone(&handoff),
                stats: Arc::clone(&self.stats),
            };
            threads.push(spawn("loopback-conv", move || converter.run())?);
            pool = Some(Arc::clone(&handoff));
            (forward_rx, ReturnPath::Pool(handoff))
        } else {
            (submit_rx, ReturnPath::Input(returns_tx))
        };

        let device = DeviceThread {
            options: self.options.clone(),
            params: params.clone(),
            jobs: encoder_jobs,
            returns: encoder_returns,
            output: recycle_rx,
            shutdown: shutdown_rx,
            completions,
            controls: Arc::clone(&controls),
            stats: Arc::clone(&self.stats),
            frame_index: 0,
            frames_since_idr: 0,
            idr_count: 0,
            headers_sent: false,
        };
        let encoder = match spawn("loopback-enc", move || device.run()) {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(pool) = &pool {
                    pool.close();
                }
                drop(submit_tx);
                for t in threads {
                    let _ = t.join();
                }
                return Err(e);
            }
        };
        threads.push(encoder);

        self.running = Some(Running {
            submit: submit_tx,
            shutdown: shutdown_tx,
            pool,
            controls,
            threads,
        });
        LoopbackStats::count(&self.stats.configures);
        lock(&self.stats.sessions).push(params.clone());
        tracing::info!(
            width = params.width,
            height = params.height,
            input_slots = self.options.input_slots,
            output_slots = self.options.output_slots,
            "Loopback device configured"
        );

        Ok(DeviceQueues {
            input,
            input_returns: returns_rx,
            output,
            output_recycle: recycle_tx,
        })
    }

    fn encode(&mut self, buffer: DeviceBuffer) -> Result<(), EncodeError> {
        self.running("encode")?
            .submit
            .send(Job::Frame(buffer))
            .map_err(|_| EncodeError::device("queue input buffer", "device thread stopped"))
    }

    fn set_rates(&mut self, update: RateUpdate) -> Result<(), EncodeError> {
        let running = self.running("set_rates")?;
        let mut controls = lock(&running.controls);
        if let Some(bps) = update.bitrate_bps {
            controls.bitrate_bps = bps;
            lock(&self.stats.bitrates).push(bps);
        }
        if let Some(fps) = update.framerate {
            controls.framerate = fps;
            lock(&self.stats.framerates).push(fps);
        }
        Ok(())
    }

    fn request_key_frame(&mut self) -> Result<(), EncodeError> {
        lock(&self.running("request_key_frame")?.controls).force_key = true;
        LoopbackStats::count(&self.stats.key_requests);
        Ok(())
    }

    fn send_end_of_stream(&mut self) -> Result<(), EncodeError> {
        self.running("send_end_of_stream")?
            .submit
            .send(Job::EndOfStream)
            .map_err(|_| EncodeError::device("queue end of stream", "device thread stopped"))
    }

    fn release(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        if let Some(pool) = &running.pool {
            pool.close();
        }
        drop(running.submit);
        drop(running.shutdown);
        for handle in running.threads {
            if handle.join().is_err() {
                tracing::error!("loopback device thread panicked");
            }
        }
        LoopbackStats::count(&self.stats.releases);
        tracing::info!("Loopback device released");
    }
}

impl Drop for LoopbackEncoder {
    fn drop(&mut self) {
        self.release();
    }
}

fn spawn(
    name: &str,
    f: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, EncodeError> {
    std::thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .map_err(|e| EncodeError::device("spawn device thread", e.to_string()))
}

/// First stage of the chain: native capture → encoder-sized I420.
struct Converter {
    jobs: Receiver<Job>,
    forward: Sender<Job>,
    returns: Sender<DeviceBuffer>,
    pool: Arc<HandoffPool>,
    stats: Arc<LoopbackStats>,
}

impl Converter {
    fn run(self) {
        while let Ok(job) = self.jobs.recv() {
            let forwarded = match job {
                Job::Frame(native) => {
                    // Blocks until the encoder gives an intermediate back.
                    let Some(mut converted) = self.pool.take() else {
                        let _ = self.returns.send(native);
                        break;
                    };
                    converted.timestamp_us = native.timestamp_us;
                    converted.flags.force_key_frame = native.flags.force_key_frame;
                    converted.bytes_used = converted.capacity();
                    let _ = self.returns.send(native);
                    LoopbackStats::count(&self.stats.frames_converted);
                    Job::Frame(converted)
                }
                Job::EndOfStream => Job::EndOfStream,
            };
            if self.forward.send(forwarded).is_err() {
                break;
            }
        }
        tracing::debug!("loopback converter stopped");
    }
}

/// The encoder proper.
struct DeviceThread {
    options: LoopbackOptions,
    params: SessionParams,
    jobs: Receiver<Job>,
    returns: ReturnPath,
    output: Receiver<DeviceBuffer>,
    shutdown: Receiver<()>,
    completions: Sender<CompletionEvent>,
    controls: Arc<Mutex<Controls>>,
    stats: Arc<LoopbackStats>,
    frame_index: u64,
    frames_since_idr: u64,
    idr_count: u32,
    headers_sent: bool,
}

impl DeviceThread {
    fn run(mut self) {
        while let Ok(job) = self.jobs.recv() {
            let keep_going = match job {
                Job::Frame(input) => self.encode(input),
                Job::EndOfStream => {
                    if self.options.stall_on_eos {
                        tracing::debug!("loopback device ignoring end of stream");
                        true
                    } else {
                        self.completions.send(CompletionEvent::EndOfStream).is_ok()
                    }
                }
            };
            if !keep_going {
                break;
            }
        }
        tracing::debug!("loopback encoder stopped");
    }

    /// Wait for the application to hand back an output buffer.
    fn next_output(&self) -> Option<DeviceBuffer> {
        select! {
            recv(self.output) -> buffer => buffer.ok(),
            recv(self.shutdown) -> _ => None,
        }
    }

    fn encode(&mut self, input: DeviceBuffer) -> bool {
        let timestamp_us = input.timestamp_us;
        let forced = input.flags.force_key_frame;
        self.returns.give_back(input);
        LoopbackStats::count(&self.stats.frames_in);

        if self.options.drop_timestamps.contains(&timestamp_us) {
            LoopbackStats::count(&self.stats.frames_dropped);
            tracing::trace!(timestamp_us, "loopback device dropping frame");
            return true;
        }
        if !self.options.process_delay.is_zero() {
            std::thread::sleep(self.options.process_delay);
        }

        let (bitrate_bps, framerate, requested) = {
            let mut controls = lock(&self.controls);
            let requested = std::mem::take(&mut controls.force_key);
            (controls.bitrate_bps, controls.framerate, requested)
        };
        let interval = u64::from(self.params.key_frame_interval.max(1));
        let idr = forced
            || requested
            || (self.frame_index == 0 && self.options.leading_idr)
            || (self.frame_index > 0 && self.frames_since_idr >= interval);
        let with_headers = idr || !self.headers_sent;

        if with_headers && self.options.profile == LoopbackProfile::VideoCore {
            let Some(mut config) = self.next_output() else {
                return false;
            };
            let headers = self.parameter_sets();
            let len = headers.len().min(config.capacity());
            config.memory_mut()[..len].copy_from_slice(&headers[..len]);
            config.bytes_used = len;
            config.timestamp_us = timestamp_us;
            config.flags.codec_config = true;
            if self.completions.send(CompletionEvent::Output(config)).is_err() {
                return false;
            }
        }

        let Some(mut out) = self.next_output() else {
            return false;
        };
        let inline_headers = with_headers && self.options.profile == LoopbackProfile::Jetson;
        let target = self.frame_size(idr, bitrate_bps, framerate).min(out.capacity());
        let au = self.access_unit(idr, inline_headers, target, bitrate_bps, framerate);
        let len = au.len().min(out.capacity());
        out.memory_mut()[..len].copy_from_slice(&au[..len]);
        out.bytes_used = len;
        out.timestamp_us = timestamp_us;
        out.flags.key_frame = idr;

        self.headers_sent = true;
        self.frame_index += 1;
        if idr {
            self.frames_since_idr = 1;
            self.idr_count = self.idr_count.wrapping_add(1);
        } else {
            self.frames_since_idr += 1;
        }
        self.completions.send(CompletionEvent::Output(out)).is_ok()
    }

    fn frame_size(&self, idr: bool, bitrate_bps: u32, framerate: u32) -> usize {
        match self.options.frame_sizing {
            FrameSizing::Fixed(bytes) => bytes,
            FrameSizing::FollowBitrate => {
                let per_frame = (bitrate_bps / 8 / framerate.max(1)) as usize;
                if idr {
                    per_frame * 3
                } else {
                    per_frame
                }
            }
        }
    }

    /// Plausible QP for the given bits per pixel.
    fn qp_for(&self, frame_bytes: usize) -> i32 {
        let pixels = f64::from(self.params.width) * f64::from(self.params.height);
        #[allow(clippy::cast_precision_loss)]
        let bpp = (frame_bytes as f64 * 8.0 / pixels).max(1e-4);
        #[allow(clippy::cast_possible_truncation)]
        let qp = (36.0 - 6.0 * (bpp / 0.1).log2()).clamp(10.0, 51.0).round() as i32;
        qp
    }

    fn parameter_sets(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.extend_from_slice(&START_CODE);
        out.push(0x67);
        out.extend(escape(&self.sps()));
        out.extend_from_slice(&START_CODE);
        out.push(0x68);
        out.extend(escape(&pps()));
        out
    }

    fn sps(&self) -> Vec<u8> {
        let profile = self.params.profile;
        let mut w = BitWriter::new();
        w.bits(u32::from(profile.profile_idc()), 8);
        w.bits(0, 8);
        w.bits(u32::from(self.params.level_idc), 8);
        w.ue(0);
        if profile == Profile::High {
            w.ue(1); // 4:2:0
            w.ue(0);
            w.ue(0);
            w.bit(false);
            w.bit(false);
        }
        w.ue(0); // log2_max_frame_num = 4
        w.ue(2); // pic_order_cnt_type
        w.ue(1);
        w.bit(false);
        w.ue(self.params.width.div_ceil(16) - 1);
        w.ue(self.params.height.div_ceil(16) - 1);
        w.bit(true); // frame_mbs_only
        w.bit(true);
        w.bit(false);
        w.bit(false);
        w.finish()
    }

    fn slice(&self, idr: bool, qp: i32) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.ue(0);
        w.ue(if idr { 7 } else { 5 });
        w.ue(0);
        #[allow(clippy::cast_possible_truncation)]
        let frame_num = if idr { 0 } else { (self.frames_since_idr % 16) as u32 };
        w.bits(frame_num, 4);
        if idr {
            w.ue(self.idr_count % 65_536);
        } else {
            w.bit(false); // num_ref_idx_active_override
            w.bit(false); // ref_pic_list_modification_flag_l0
        }
        // dec_ref_pic_marking
        w.bit(false);
        if idr {
            w.bit(false);
        }
        w.se(qp - 26);
        w.ue(0); // disable_deblocking_filter_idc
        w.se(0);
        w.se(0);
        w.finish()
    }

    fn access_unit(
        &self,
        idr: bool,
        inline_headers: bool,
        target: usize,
        bitrate_bps: u32,
        framerate: u32,
    ) -> Vec<u8> {
        let mut au = Vec::with_capacity(target.max(64));
        if inline_headers {
            au.extend(self.parameter_sets());
        }
        let qp = self.qp_for(self.frame_size(idr, bitrate_bps, framerate));
        au.extend_from_slice(&START_CODE);
        au.push(if idr { 0x65 } else { 0x41 });
        au.extend(escape(&self.slice(idr, qp)));
        // Filler slice data plus a final stop byte.
        let filler = target.saturating_sub(au.len() + 1);
        au.resize(au.len() + filler, SLICE_FILLER);
        au.push(0x80);
        au
    }
}

fn pps() -> Vec<u8> {
    let mut w = BitWriter::new();
    w.ue(0);
    w.ue(0);
    w.bit(false); // CAVLC
    w.bit(false);
    w.ue(0);
    w.ue(0);
    w.ue(0);
    w.bit(false);
    w.bits(0, 2);
    w.se(0); // pic_init_qp_minus26
    w.se(0);
    w.se(0);
    w.bit(true); // deblocking_filter_control_present
    w.bit(false);
    w.bit(false);
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::{frame_access_unit, h264::H264Parser, NAL_IDR, NAL_SPS};

    fn params() -> SessionParams {
        SessionParams {
            width: 640,
            height: 480,
            framerate: 30,
            bitrate_bps: 1_000_000,
            profile: Profile::High,
            level_idc: 51,
            key_frame_interval: 3,
            input: InputFormat::I420,
        }
    }

    struct Harness {
        encoder: LoopbackEncoder,
        queues: DeviceQueues,
        events: Receiver<CompletionEvent>,
    }

    fn start(options: LoopbackOptions) -> Harness {
        let mut encoder = LoopbackEncoder::new(options);
        let (tx, events) = unbounded();
        let Ok(queues) = encoder.configure(&params(), tx) else {
            panic!("loopback configure failed");
        };
        Harness {
            encoder,
            queues,
            events,
        }
    }

    impl Harness {
        fn queue_outputs(&mut self) {
            for buffer in self.queues.output.drain(..) {
                self.queues.output_recycle.send(buffer).unwrap();
            }
        }

        fn submit(&mut self, ts: u64) {
            let mut buffer = self.queues.input.pop().unwrap();
            buffer.timestamp_us = ts;
            self.encoder.encode(buffer).unwrap();
            let back = self
                .queues
                .input_returns
                .recv_timeout(Duration::from_secs(1))
                .unwrap();
            self.queues.input.push(back);
        }

        fn next_output(&self) -> DeviceBuffer {
            match self.events.recv_timeout(Duration::from_secs(1)).unwrap() {
                CompletionEvent::Output(buffer) => buffer,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn jetson_profile_inlines_headers_on_idr() {
        let mut h = start(LoopbackOptions::new(LoopbackProfile::Jetson));
        h.queue_outputs();
        let mut parser = H264Parser::new();
        let mut kinds = Vec::new();
        for ts in [1000, 2000, 3000, 4000] {
            h.submit(ts);
            let out = h.next_output();
            assert_eq!(out.timestamp_us, ts);
            let layout = frame_access_unit(out.filled());
            assert_eq!(layout.key_frame, out.flags.key_frame);
            assert!(parser.parse_access_unit(out.filled(), &layout.units).is_some());
            kinds.push((layout.units[0].nal_type, layout.key_frame));
            h.queues.output_recycle.send(out).unwrap();
        }
        // Interval 3: IDR, P, P, IDR.
        assert_eq!(
            kinds,
            vec![(NAL_SPS, true), (1, false), (1, false), (NAL_SPS, true)]
        );
        h.encoder.release();
    }

    #[test]
    fn videocore_profile_emits_separate_config() {
        let mut h = start(LoopbackOptions::new(LoopbackProfile::VideoCore));
        h.queue_outputs();
        h.submit(1000);
        let config = h.next_output();
        assert!(config.flags.codec_config);
        let frame = h.next_output();
        assert!(!frame.flags.codec_config);
        let layout = frame_access_unit(frame.filled());
        assert_eq!(layout.units.len(), 1);
        assert_eq!(layout.units[0].nal_type, NAL_IDR);
        h.encoder.release();
    }

    #[test]
    fn fixed_sizing_is_exact() {
        let mut options = LoopbackOptions::new(LoopbackProfile::Jetson);
        options.frame_sizing = FrameSizing::Fixed(50_000);
        options.leading_idr = false;
        let mut h = start(options);
        h.queue_outputs();
        h.submit(1000);
        let out = h.next_output();
        assert_eq!(out.bytes_used, 50_000);
        assert!(!out.flags.key_frame);
        h.encoder.release();
    }

    #[test]
    fn output_waits_for_recycled_buffers() {
        let mut h = start(LoopbackOptions::new(LoopbackProfile::Jetson));
        h.submit(1000);
        assert!(h.events.recv_timeout(Duration::from_millis(50)).is_err());
        h.queue_outputs();
        assert_eq!(h.next_output().timestamp_us, 1000);
        h.encoder.release();
    }

    #[test]
    fn end_of_stream_is_acknowledged() {
        let mut h = start(LoopbackOptions::new(LoopbackProfile::Jetson));
        h.encoder.send_end_of_stream().unwrap();
        assert!(matches!(
            h.events.recv_timeout(Duration::from_secs(1)),
            Ok(CompletionEvent::EndOfStream)
        ));
        h.encoder.release();
        h.encoder.release();
        assert_eq!(h.encoder.stats().releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn injected_configure_failure() {
        let mut options = LoopbackOptions::new(LoopbackProfile::Jetson);
        options.fail_configure = true;
        let mut encoder = LoopbackEncoder::new(options);
        let (tx, _rx) = unbounded();
        let err = encoder.configure(&params(), tx).err().unwrap();
        assert!(err.is_fatal());
        assert!(matches!(
            encoder.encode(DeviceBuffer::detached()),
            Err(EncodeError::Uninitialized(_))
        ));
    }
}
