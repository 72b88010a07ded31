//! Completion delivery: the single thread that turns device output into
//! [`EncodedUnit`]s and hands them to the registered sink.
//!
//! Device completion threads never call the consumer. They post
//! [`CompletionEvent`]s to a bounded channel; this loop correlates each
//! output with its frame parameters, frames it, extracts the QP, invokes
//! the sink, feeds the rate adjuster and gives the buffer back to the
//! device.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{select, unbounded, Receiver, Sender};

use crate::backend::CompletionEvent;
use crate::bitstream::h264::H264Parser;
use crate::bitstream::{frame_access_unit, NalUnit};
use crate::frame::{ColorSpace, ContentType, FrameType, Rotation};
use crate::ledger::FrameParamLedger;
use crate::pipeline::PipelineStats;
use crate::queue::{DeviceBuffer, OutputSlots};
use crate::rate::RateAdjuster;
use crate::{EncodeError, SinkError};

/// One encoded access unit, lent to the sink for the duration of the call.
#[derive(Debug, Clone, Copy)]
pub struct EncodedUnit<'a> {
    pub data: &'a [u8],
    pub frame_type: FrameType,
    pub timestamp_us: u64,
    pub width: u32,
    pub height: u32,
    /// Render time of the source frame.
    pub render_time_ms: i64,
    pub ntp_time_ms: i64,
    pub rotation: Rotation,
    pub color_space: Option<ColorSpace>,
    pub content_type: ContentType,
    /// NAL unit spans within `data`.
    pub fragments: &'a [NalUnit],
    /// QP of the last slice, when it could be parsed.
    pub qp: Option<u8>,
}

impl EncodedUnit<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn is_key_frame(&self) -> bool {
        self.frame_type == FrameType::Key
    }

    /// Copy the unit out of the device buffer.
    #[must_use]
    pub fn to_owned_unit(&self) -> OwnedEncodedUnit {
        OwnedEncodedUnit {
            data: Bytes::copy_from_slice(self.data),
            frame_type: self.frame_type,
            timestamp_us: self.timestamp_us,
            width: self.width,
            height: self.height,
            render_time_ms: self.render_time_ms,
            ntp_time_ms: self.ntp_time_ms,
            rotation: self.rotation,
            color_space: self.color_space,
            content_type: self.content_type,
            fragments: self.fragments.to_vec(),
            qp: self.qp,
        }
    }
}

/// Owned copy of an [`EncodedUnit`].
#[derive(Debug, Clone)]
pub struct OwnedEncodedUnit {
    pub data: Bytes,
    pub frame_type: FrameType,
    pub timestamp_us: u64,
    pub width: u32,
    pub height: u32,
    pub render_time_ms: i64,
    pub ntp_time_ms: i64,
    pub rotation: Rotation,
    pub color_space: Option<ColorSpace>,
    pub content_type: ContentType,
    pub fragments: Vec<NalUnit>,
    pub qp: Option<u8>,
}

impl OwnedEncodedUnit {
    /// Payload of each fragment.
    pub fn fragment_payloads(&self) -> impl Iterator<Item = Bytes> + '_ {
        self.fragments
            .iter()
            .map(|f| self.data.slice(f.offset..f.offset + f.length))
    }
}

/// Consumer of encoded output. Runs on the delivery thread.
pub trait EncodedSink: Send {
    /// Accept one unit. The borrowed data is only valid during the call.
    ///
    /// # Errors
    ///
    /// [`SinkError`] if the unit could not be taken; it is then not
    /// counted towards the rate estimate.
    fn on_encoded(&mut self, unit: &EncodedUnit<'_>) -> Result<(), SinkError>;
}

impl<F> EncodedSink for F
where
    F: FnMut(&EncodedUnit<'_>) -> Result<(), SinkError> + Send,
{
    fn on_encoded(&mut self, unit: &EncodedUnit<'_>) -> Result<(), SinkError> {
        self(unit)
    }
}

/// Sink that forwards owned copies over a channel.
pub struct ChannelSink(pub Sender<OwnedEncodedUnit>);

impl EncodedSink for ChannelSink {
    fn on_encoded(&mut self, unit: &EncodedUnit<'_>) -> Result<(), SinkError> {
        self.0
            .send(unit.to_owned_unit())
            .map_err(|_| SinkError::Closed)
    }
}

pub(crate) type SharedSink = Arc<Mutex<Option<Box<dyn EncodedSink>>>>;

pub(crate) fn lock_shared<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(|e| {
        tracing::warn!("pipeline mutex was poisoned, recovering");
        e.into_inner()
    })
}

/// State shared between the facade and the delivery thread.
#[derive(Clone)]
pub(crate) struct DeliveryContext {
    pub ledger: Arc<FrameParamLedger>,
    pub rate: Arc<Mutex<RateAdjuster>>,
    pub sink: SharedSink,
    pub stats: Arc<PipelineStats>,
    pub content_type: ContentType,
}

/// Handle to a running delivery thread.
pub(crate) struct DeliveryLoop {
    thread: Option<JoinHandle<()>>,
    shutdown: Option<Sender<()>>,
    drained: Receiver<()>,
}

impl DeliveryLoop {
    /// Start the thread. It owns the event receiver and the only handle
    /// for giving output buffers back to the device.
    pub fn spawn(
        context: DeliveryContext,
        events: Receiver<CompletionEvent>,
        recycle: Sender<DeviceBuffer>,
        output_slots: usize,
    ) -> Result<Self, EncodeError> {
        let (shutdown_tx, shutdown_rx) = unbounded();
        let (drained_tx, drained_rx) = unbounded();
        let worker = Worker {
            context,
            events,
            shutdown: shutdown_rx,
            drained: drained_tx,
            recycle,
            slots: OutputSlots::new(output_slots),
            parser: H264Parser::new(),
            pending_config: Vec::new(),
            scratch: Vec::new(),
        };
        let thread = std::thread::Builder::new()
            .name("hwenc-delivery".into())
            .spawn(move || worker.run())
            .map_err(|e| EncodeError::device("spawn delivery thread", e.to_string()))?;

        Ok(Self {
            thread: Some(thread),
            shutdown: Some(shutdown_tx),
            drained: drained_rx,
        })
    }

    /// Block until the device acknowledged end-of-stream or `timeout`
    /// passes. Returns whether the drain completed.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        self.drained.recv_timeout(timeout).is_ok()
    }

    /// Stop the thread and wait for it. No sink call runs after this.
    pub fn stop(&mut self) {
        drop(self.shutdown.take());
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("delivery thread panicked");
            }
        }
    }
}

impl Drop for DeliveryLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    context: DeliveryContext,
    events: Receiver<CompletionEvent>,
    shutdown: Receiver<()>,
    drained: Sender<()>,
    recycle: Sender<DeviceBuffer>,
    slots: OutputSlots,
    parser: H264Parser,
    /// Out-of-band parameter sets waiting for the next frame.
    pending_config: Vec<u8>,
    scratch: Vec<u8>,
}

impl Worker {
    fn run(mut self) {
        loop {
            select! {
                recv(self.events) -> event => match event {
                    Ok(event) => self.handle(event),
                    Err(_) => break,
                },
                recv(self.shutdown) -> _ => break,
            }
        }
        tracing::debug!("delivery loop stopped");
    }

    fn handle(&mut self, event: CompletionEvent) {
        match event {
            CompletionEvent::Output(buffer) => self.handle_output(buffer),
            CompletionEvent::EndOfStream => {
                tracing::debug!("device reached end of stream");
                let _ = self.drained.send(());
            }
            CompletionEvent::Error(reason) => {
                tracing::error!(%reason, "asynchronous device error");
                self.context.stats.device_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn recycle(&mut self, buffer: DeviceBuffer) {
        self.slots.requeued(buffer.index());
        // Fails only once the device has gone; the buffer is freed with it.
        let _ = self.recycle.send(buffer);
    }

    fn handle_output(&mut self, buffer: DeviceBuffer) {
        if !self.slots.delivered(buffer.index()) {
            tracing::error!(index = buffer.index(), "device delivered an output slot it did not own");
            self.context.stats.device_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if buffer.bytes_used == 0 {
            self.recycle(buffer);
            return;
        }
        if buffer.flags.codec_config {
            tracing::trace!(len = buffer.bytes_used, "stashing codec config");
            self.pending_config.clear();
            self.pending_config.extend_from_slice(buffer.filled());
            self.recycle(buffer);
            return;
        }

        let params = match self.context.ledger.take_matching(buffer.timestamp_us) {
            Ok(params) => params,
            Err(stale) => {
                tracing::warn!(
                    timestamp_us = stale.timestamp_us,
                    discarded = stale.discarded,
                    "Frame parameters not found, skipping frame"
                );
                self.context.stats.stale_outputs.fetch_add(1, Ordering::Relaxed);
                self.recycle(buffer);
                return;
            }
        };

        let data: &[u8] = if self.pending_config.is_empty() {
            buffer.filled()
        } else {
            self.scratch.clear();
            self.scratch.extend_from_slice(&self.pending_config);
            self.scratch.extend_from_slice(buffer.filled());
            self.pending_config.clear();
            &self.scratch
        };

        let layout = frame_access_unit(data);
        if layout.units.is_empty() {
            tracing::warn!(
                timestamp_us = params.timestamp_us,
                len = data.len(),
                "encoded output has no start codes, delivering as delta"
            );
            self.context.stats.malformed_units.fetch_add(1, Ordering::Relaxed);
        }
        let qp = self.parser.parse_access_unit(data, &layout.units);
        let unit = EncodedUnit {
            data,
            frame_type: if layout.key_frame {
                FrameType::Key
            } else {
                FrameType::Delta
            },
            timestamp_us: params.timestamp_us,
            width: params.width,
            height: params.height,
            render_time_ms: params.render_time_ms,
            ntp_time_ms: params.ntp_time_ms,
            rotation: params.rotation,
            color_space: params.color_space,
            content_type: self.context.content_type,
            fragments: &layout.units,
            qp,
        };

        let result = match lock_shared(&self.context.sink).as_mut() {
            Some(sink) => sink.on_encoded(&unit),
            None => Err(SinkError::Closed),
        };
        match result {
            Ok(()) => {
                lock_shared(&self.context.rate).update(unit.len());
                self.context.stats.units_delivered.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    timestamp_us = unit.timestamp_us,
                    len = unit.len(),
                    key = unit.is_key_frame(),
                    qp = ?unit.qp,
                    "encoded unit delivered"
                );
            }
            Err(e) => {
                tracing::error!(timestamp_us = unit.timestamp_us, error = %e, "sink rejected encoded unit");
                self.context.stats.delivery_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.recycle(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameBuffer, I420Buffer, RawFrame};
    use crate::ledger::FrameParams;
    use crate::queue::Plane;

    struct Fixture {
        context: DeliveryContext,
        events: Sender<CompletionEvent>,
        recycled: Receiver<DeviceBuffer>,
        received: Receiver<OwnedEncodedUnit>,
        delivery: DeliveryLoop,
    }

    fn fixture(slots: usize) -> Fixture {
        let (unit_tx, received) = unbounded();
        let sink: Box<dyn EncodedSink> = Box::new(ChannelSink(unit_tx));
        let context = DeliveryContext {
            ledger: Arc::new(FrameParamLedger::new(16)),
            rate: Arc::new(Mutex::new(RateAdjuster::default())),
            sink: Arc::new(Mutex::new(Some(sink))),
            stats: Arc::new(PipelineStats::default()),
            content_type: ContentType::Screenshare,
        };
        lock_shared(&context.rate).set_target(1_000_000, 30.0);
        let (events, events_rx) = unbounded();
        let (recycle_tx, recycled) = unbounded();
        let delivery = DeliveryLoop::spawn(context.clone(), events_rx, recycle_tx, slots).unwrap();
        Fixture {
            context,
            events,
            recycled,
            received,
            delivery,
        }
    }

    fn frame_params(ts: u64) -> FrameParams {
        FrameParams::from_frame(&RawFrame::new(
            FrameBuffer::I420(I420Buffer::filled(320, 240, 16)),
            ts,
        ))
    }

    fn output(index: usize, ts: u64, payload: &[u8]) -> DeviceBuffer {
        let mut buffer = DeviceBuffer::allocate(index, Plane::bytes(256));
        buffer.write_payload(payload).unwrap();
        buffer.timestamp_us = ts;
        buffer
    }

    const IDR_AU: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21];
    const P_AU: &[u8] = &[0, 0, 0, 1, 0x41, 0x9A, 0x02];

    #[test]
    fn delivers_with_ledger_parameters_and_recycles() {
        let mut f = fixture(2);
        f.context.ledger.push(frame_params(1000));
        f.events.send(CompletionEvent::Output(output(0, 1000, IDR_AU))).unwrap();

        let unit = f.received.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(unit.frame_type, FrameType::Key);
        assert_eq!((unit.width, unit.height), (320, 240));
        assert_eq!(unit.render_time_ms, 1);
        assert_eq!(unit.content_type, ContentType::Screenshare);
        assert_eq!(unit.fragment_payloads().next().unwrap().as_ref(), &IDR_AU[4..]);
        assert_eq!(unit.qp, None);

        let back = f.recycled.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(back.index(), 0);
        f.delivery.stop();
        assert_eq!(lock_shared(&f.context.rate).estimated_frame_bytes(), Some(8.0));
    }

    #[test]
    fn stale_output_is_skipped_but_recycled() {
        let mut f = fixture(2);
        f.events.send(CompletionEvent::Output(output(1, 5000, P_AU))).unwrap();
        assert_eq!(f.recycled.recv_timeout(Duration::from_secs(1)).unwrap().index(), 1);
        f.delivery.stop();
        assert!(f.received.try_recv().is_err());
        assert_eq!(f.context.stats.snapshot().stale_outputs, 1);
    }

    #[test]
    fn codec_config_is_prepended_to_next_frame() {
        let mut f = fixture(2);
        f.context.ledger.push(frame_params(1000));
        let mut config = output(0, 1000, &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE]);
        config.flags.codec_config = true;
        f.events.send(CompletionEvent::Output(config)).unwrap();
        f.events.send(CompletionEvent::Output(output(1, 1000, IDR_AU))).unwrap();

        let unit = f.received.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(unit.fragments.len(), 3);
        assert_eq!(unit.fragments[0].nal_type, 7);
        assert!(unit.data.ends_with(IDR_AU));
        f.delivery.stop();
    }

    #[test]
    fn output_without_start_codes_counts_as_malformed() {
        let mut f = fixture(1);
        f.context.ledger.push(frame_params(1000));
        f.events.send(CompletionEvent::Output(output(0, 1000, &[0x65, 0x01]))).unwrap();
        let unit = f.received.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(unit.frame_type, FrameType::Delta);
        assert!(unit.fragments.is_empty());
        f.delivery.stop();
        assert_eq!(f.context.stats.snapshot().malformed_units, 1);
    }

    #[test]
    fn rejected_unit_does_not_feed_rate_adjuster() {
        let mut f = fixture(1);
        let reject: Box<dyn EncodedSink> =
            Box::new(|_: &EncodedUnit<'_>| -> Result<(), SinkError> {
                Err(SinkError::Rejected("full".into()))
            });
        *lock_shared(&f.context.sink) = Some(reject);
        f.context.ledger.push(frame_params(1000));
        f.events.send(CompletionEvent::Output(output(0, 1000, P_AU))).unwrap();
        f.recycled.recv_timeout(Duration::from_secs(1)).unwrap();
        f.delivery.stop();
        assert_eq!(f.context.stats.snapshot().delivery_failures, 1);
        assert_eq!(lock_shared(&f.context.rate).estimated_frame_bytes(), None);
    }

    #[test]
    fn end_of_stream_signals_drain() {
        let mut f = fixture(1);
        assert!(!f.delivery.wait_drained(Duration::from_millis(10)));
        f.events.send(CompletionEvent::EndOfStream).unwrap();
        assert!(f.delivery.wait_drained(Duration::from_secs(1)));
        f.delivery.stop();
    }

    #[test]
    fn zero_length_output_is_recycled_silently() {
        let mut f = fixture(1);
        f.events.send(CompletionEvent::Output(output(0, 1000, &[]))).unwrap();
        f.recycled.recv_timeout(Duration::from_secs(1)).unwrap();
        f.delivery.stop();
        assert_eq!(f.context.stats.snapshot().stale_outputs, 0);
        assert!(f.received.try_recv().is_err());
    }
}
