//! Session controller: device lifecycle and the input side of the queue
//! pair.
//!
//! ```text
//! Uninitialized ──configure──▶ Configured ──queues armed──▶ Streaming
//!       ▲                                                       │
//!       └──────────── release (EOS, bounded drain) ◀── Draining ◀┘
//! ```

use std::time::Duration;

use crossbeam_channel::bounded;

use crate::backend::{EncoderCapabilities, HardwareEncoder, RateUpdate, SessionParams};
use crate::delivery::{DeliveryContext, DeliveryLoop};
use crate::frame::{FrameBuffer, I420Buffer, RawFrame};
use crate::ledger::FrameParams;
use crate::queue::{DeviceBuffer, InputQueue};
use crate::rate::RateGate;
use crate::EncodeError;

/// Lifecycle state of the encoding session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device resources are held.
    Uninitialized,
    /// The device accepted the format; queues are not armed yet.
    Configured,
    /// Frames may be submitted.
    Streaming,
    /// End-of-stream sent, waiting for the device to flush.
    Draining,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Configured => write!(f, "configured"),
            Self::Streaming => write!(f, "streaming"),
            Self::Draining => write!(f, "draining"),
        }
    }
}

struct ActiveSession {
    params: SessionParams,
    input: InputQueue,
    delivery: DeliveryLoop,
    gate: RateGate,
    context: DeliveryContext,
}

/// Owns the backend and at most one live session.
pub struct SessionController {
    backend: Box<dyn HardwareEncoder>,
    state: SessionState,
    active: Option<ActiveSession>,
    drain_timeout: Duration,
    completion_queue_depth: usize,
    min_bitrate_bps: u32,
}

impl SessionController {
    #[must_use]
    pub fn new(
        backend: Box<dyn HardwareEncoder>,
        drain_timeout: Duration,
        completion_queue_depth: usize,
    ) -> Self {
        Self {
            backend,
            state: SessionState::Uninitialized,
            active: None,
            drain_timeout,
            completion_queue_depth: completion_queue_depth.max(1),
            min_bitrate_bps: 0,
        }
    }

    /// Raise the floor below which bitrate pushes are ignored. The
    /// backend's own minimum still applies. Takes effect on the next
    /// configure.
    pub fn set_min_bitrate(&mut self, min_bitrate_bps: u32) {
        self.min_bitrate_bps = min_bitrate_bps;
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Parameters of the live session.
    #[must_use]
    pub fn params(&self) -> Option<&SessionParams> {
        self.active.as_ref().map(|a| &a.params)
    }

    #[must_use]
    pub fn capabilities(&self) -> EncoderCapabilities {
        self.backend.capabilities()
    }

    /// Negotiate a new session, releasing any live one first.
    ///
    /// # Errors
    ///
    /// [`EncodeError::Device`] if negotiation or queue setup fails. The
    /// partially built device is released and the state is
    /// [`SessionState::Uninitialized`].
    pub(crate) fn configure(
        &mut self,
        params: SessionParams,
        context: DeliveryContext,
    ) -> Result<(), EncodeError> {
        self.release();

        let (events_tx, events_rx) = bounded(self.completion_queue_depth);
        let queues = match self.backend.configure(&params, events_tx) {
            Ok(queues) => queues,
            Err(e) => return Err(self.abort(e)),
        };
        self.state = SessionState::Configured;

        let output_count = queues.output.len();
        let input = match InputQueue::new(queues.input, queues.input_returns) {
            Ok(input) => input,
            Err(e) => return Err(self.abort(e)),
        };
        context.ledger.clear();
        context.ledger.set_capacity(input.len() + output_count);

        for buffer in queues.output {
            if queues.output_recycle.send(buffer).is_err() {
                return Err(self.abort(EncodeError::device(
                    "queue output buffers",
                    "device closed its output queue",
                )));
            }
        }
        let delivery = match DeliveryLoop::spawn(
            context.clone(),
            events_rx,
            queues.output_recycle,
            output_count,
        ) {
            Ok(delivery) => delivery,
            Err(e) => return Err(self.abort(e)),
        };

        let caps = self.backend.capabilities();
        let min_bitrate = caps.min_bitrate_bps.max(self.min_bitrate_bps);
        let gate = RateGate::new(min_bitrate, caps.framerate_cap)
            .with_applied(params.bitrate_bps, params.framerate);

        tracing::info!(
            encoder = caps.implementation_name,
            width = params.width,
            height = params.height,
            framerate = params.framerate,
            bitrate = params.bitrate_bps,
            profile = params.profile.as_str(),
            level = params.level_idc,
            input_slots = input.len(),
            output_slots = output_count,
            "Encode session streaming"
        );
        self.active = Some(ActiveSession {
            params,
            input,
            delivery,
            gate,
            context,
        });
        self.state = SessionState::Streaming;
        Ok(())
    }

    fn abort(&mut self, error: EncodeError) -> EncodeError {
        tracing::error!(%error, "Session configuration failed");
        self.backend.release();
        self.state = SessionState::Uninitialized;
        error
    }

    /// Drain and tear down the live session.
    ///
    /// Returns `false` if there was nothing to release.
    pub fn release(&mut self) -> bool {
        let Some(mut active) = self.active.take() else {
            self.state = SessionState::Uninitialized;
            return false;
        };
        self.state = SessionState::Draining;

        match self.backend.send_end_of_stream() {
            Ok(()) => {
                if !active.delivery.wait_drained(self.drain_timeout) {
                    tracing::warn!(
                        timeout_ms = self.drain_timeout.as_millis(),
                        "Device did not reach end of stream in time, releasing anyway"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to send end of stream"),
        }

        active.delivery.stop();
        self.backend.release();
        active.context.ledger.clear();
        drop(active);

        self.state = SessionState::Uninitialized;
        tracing::info!("Encode session released");
        true
    }

    /// Copy `frame` into a free input slot and queue it.
    ///
    /// # Errors
    ///
    /// [`EncodeError::ResourceExhausted`] when no slot is free,
    /// [`EncodeError::InvalidFrame`] when the frame does not fit the slot,
    /// [`EncodeError::Device`] when the device refuses it.
    pub(crate) fn submit(&mut self, frame: &RawFrame, force_key: bool) -> Result<(), EncodeError> {
        let active = self
            .active
            .as_mut()
            .ok_or(EncodeError::Uninitialized("no active session"))?;

        let mut buffer = active.input.checkout()?;
        if let Err(e) = fill_input(&mut buffer, frame) {
            active.input.checkin(buffer);
            return Err(e);
        }
        buffer.timestamp_us = frame.timestamp_us;
        buffer.flags.force_key_frame = force_key;

        let timestamp_us = frame.timestamp_us;
        active.context.ledger.push(FrameParams::from_frame(frame));
        if let Err(e) = self.backend.encode(buffer) {
            active.context.ledger.retract(timestamp_us);
            tracing::error!(timestamp_us, error = %e, "Failed to queue input buffer");
            return Err(e);
        }
        tracing::trace!(timestamp_us, force_key, "frame queued");
        Ok(())
    }

    /// Ask the device for an IDR. Failures are logged only.
    pub(crate) fn request_key_frame(&mut self) {
        if self.active.is_none() {
            return;
        }
        if let Err(e) = self.backend.request_key_frame() {
            tracing::warn!(error = %e, "Failed to force IDR");
        }
    }

    /// Push bitrate and framerate through the gate. Failures are logged.
    pub(crate) fn apply_rates(&mut self, bitrate_bps: u32, framerate: u32) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let update = RateUpdate {
            bitrate_bps: active.gate.bitrate(bitrate_bps),
            framerate: active
                .gate
                .framerate(framerate, active.params.width, active.params.height),
        };
        if update == RateUpdate::default() {
            return;
        }
        match self.backend.set_rates(update) {
            Ok(()) => tracing::debug!(
                bitrate = ?update.bitrate_bps,
                framerate = ?update.framerate,
                "Encoder rates updated"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to set encoder rates"),
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.release();
    }
}

/// Copy a raw frame into an input buffer.
fn fill_input(buffer: &mut DeviceBuffer, frame: &RawFrame) -> Result<(), EncodeError> {
    match &frame.buffer {
        FrameBuffer::I420(src) => fill_i420(buffer, src),
        FrameBuffer::Native(native) => buffer.write_payload(&native.data),
    }
}

fn fill_i420(buffer: &mut DeviceBuffer, src: &I420Buffer) -> Result<(), EncodeError> {
    if buffer.planes().len() < 3 {
        return Err(EncodeError::InvalidFrame(
            "planar frame submitted to a non-planar session".into(),
        ));
    }
    let (cw, ch) = src.chroma_size();
    let sources = [
        (&src.y, src.stride_y, src.width as usize, src.height as usize),
        (&src.u, src.stride_u, cw, ch),
        (&src.v, src.stride_v, cw, ch),
    ];
    let mut end = 0;
    for (n, (plane, stride, row_bytes, rows)) in sources.into_iter().enumerate() {
        let layout = buffer.planes()[n];
        if layout.stride < row_bytes || layout.rows < rows {
            return Err(EncodeError::InvalidFrame(format!(
                "plane {n} of {row_bytes}x{rows} does not fit slot {}x{}",
                layout.stride, layout.rows
            )));
        }
        end = end.max(layout.offset + layout.len);
        let Some(dst) = buffer.plane_mut(n) else {
            return Err(EncodeError::InvalidFrame(format!("slot has no plane {n}")));
        };
        copy_plane(dst, layout.stride, plane, stride, row_bytes, rows)?;
    }
    buffer.bytes_used = end;
    Ok(())
}

/// Row-by-row copy honoring both strides.
fn copy_plane(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    row_bytes: usize,
    rows: usize,
) -> Result<(), EncodeError> {
    for row in 0..rows {
        let from = src
            .get(row * src_stride..row * src_stride + row_bytes)
            .ok_or_else(|| EncodeError::InvalidFrame(format!("source row {row} out of bounds")))?;
        let to = dst
            .get_mut(row * dst_stride..row * dst_stride + row_bytes)
            .ok_or_else(|| EncodeError::InvalidFrame(format!("slot row {row} out of bounds")))?;
        to.copy_from_slice(from);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;

    use super::*;
    use crate::backend::loopback::{LoopbackEncoder, LoopbackOptions, LoopbackProfile};
    use crate::backend::{InputFormat, Profile};
    use crate::frame::ContentType;
    use crate::ledger::FrameParamLedger;
    use crate::pipeline::PipelineStats;
    use crate::queue::Plane;
    use crate::rate::RateAdjuster;

    fn context() -> DeliveryContext {
        DeliveryContext {
            ledger: Arc::new(FrameParamLedger::new(4)),
            rate: Arc::new(Mutex::new(RateAdjuster::default())),
            sink: Arc::new(Mutex::new(None)),
            stats: Arc::new(PipelineStats::default()),
            content_type: ContentType::Unspecified,
        }
    }

    fn params() -> SessionParams {
        SessionParams {
            width: 64,
            height: 48,
            framerate: 30,
            bitrate_bps: 1_000_000,
            profile: Profile::High,
            level_idc: 51,
            key_frame_interval: 30,
            input: InputFormat::I420,
        }
    }

    #[test]
    fn copies_rows_into_padded_slot() {
        let mut buffer = DeviceBuffer::allocate(0, Plane::i420(6, 4, 8, 2));
        let src = I420Buffer::filled(6, 4, 200);
        fill_i420(&mut buffer, &src).unwrap();
        let y = buffer.plane_mut(0).unwrap();
        assert_eq!(&y[..6], &[200; 6]);
        assert_eq!(&y[6..8], &[0, 0]);
        assert_eq!(buffer.bytes_used, 8 * 4 + 4 * 2 * 2);
    }

    #[test]
    fn oversized_frame_is_invalid() {
        let mut buffer = DeviceBuffer::allocate(0, Plane::i420(4, 4, 4, 2));
        let src = I420Buffer::filled(8, 8, 1);
        assert!(matches!(
            fill_i420(&mut buffer, &src),
            Err(EncodeError::InvalidFrame(_))
        ));
        let mut bytes = DeviceBuffer::allocate(0, Plane::bytes(2));
        assert!(bytes.write_payload(&Bytes::from_static(&[1, 2, 3])).is_err());
    }

    #[test]
    fn lifecycle_states() {
        let encoder = LoopbackEncoder::new(LoopbackOptions::new(LoopbackProfile::Jetson));
        let stats = encoder.stats();
        let mut session = SessionController::new(Box::new(encoder), Duration::from_secs(2), 8);
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(!session.release());

        let ctx = context();
        session.configure(params(), ctx.clone()).unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.params().map(|p| p.width), Some(64));

        // Reconfiguring releases the previous session first.
        session.configure(params(), ctx).unwrap();
        assert_eq!(stats.configures.load(Ordering::SeqCst), 2);
        assert_eq!(stats.releases.load(Ordering::SeqCst), 1);

        assert!(session.release());
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(!session.release());
        assert_eq!(stats.releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_configure_returns_to_uninitialized() {
        let mut options = LoopbackOptions::new(LoopbackProfile::Jetson);
        options.fail_configure = true;
        let mut session = SessionController::new(
            Box::new(LoopbackEncoder::new(options)),
            Duration::from_secs(2),
            8,
        );
        let err = session.configure(params(), context()).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(session.params().is_none());
    }

    #[test]
    fn ledger_is_sized_to_in_flight_capacity() {
        let mut options = LoopbackOptions::new(LoopbackProfile::Jetson);
        options.input_slots = 3;
        options.output_slots = 2;
        let mut session = SessionController::new(
            Box::new(LoopbackEncoder::new(options)),
            Duration::from_secs(2),
            8,
        );
        let ctx = context();
        session.configure(params(), ctx.clone()).unwrap();
        for ts in 1..=6 {
            ctx.ledger.push(FrameParams {
                width: 64,
                height: 48,
                render_time_ms: 0,
                ntp_time_ms: 0,
                timestamp_us: ts,
                rotation: crate::frame::Rotation::Deg0,
                color_space: None,
            });
        }
        assert_eq!(ctx.ledger.len(), 5);
        session.release();
        assert!(ctx.ledger.is_empty());
    }
}
