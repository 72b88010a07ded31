//! Device queue pair: fixed rings of buffers exchanged with the device.
//!
//! Buffers are allocated once per session and then only change hands.
//! Ownership moves with the [`DeviceBuffer`] value itself: while the device
//! holds a buffer, the ring's slot records [`SlotOwner::Device`] and has no
//! access to its memory.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, TryRecvError};

use crate::EncodeError;

/// One plane inside a buffer's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    pub offset: usize,
    pub len: usize,
    /// Bytes per row; equals `len` for single-row payload planes.
    pub stride: usize,
    /// Rows of this plane (1 for byte payloads).
    pub rows: usize,
}

impl Plane {
    /// Lay out three I420 planes with the given row and height alignment.
    #[must_use]
    pub fn i420(width: u32, height: u32, align_w: u32, align_h: u32) -> Vec<Plane> {
        let stride_y = width.next_multiple_of(align_w.max(1)) as usize;
        let rows_y = height.next_multiple_of(align_h.max(1)) as usize;
        let stride_c = stride_y / 2;
        let rows_c = rows_y / 2;
        let y = Plane {
            offset: 0,
            len: stride_y * rows_y,
            stride: stride_y,
            rows: rows_y,
        };
        let u = Plane {
            offset: y.len,
            len: stride_c * rows_c,
            stride: stride_c,
            rows: rows_c,
        };
        let v = Plane {
            offset: u.offset + u.len,
            ..u
        };
        vec![y, u, v]
    }

    /// A single opaque byte plane (compressed or native payloads).
    #[must_use]
    pub fn bytes(len: usize) -> Vec<Plane> {
        vec![Plane {
            offset: 0,
            len,
            stride: len,
            rows: 1,
        }]
    }
}

/// Per-buffer flags reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// The encoder marked the payload as a key frame.
    pub key_frame: bool,
    /// Out-of-band parameter sets, to be prepended to the next frame.
    pub codec_config: bool,
    /// Request an IDR for this input.
    pub force_key_frame: bool,
}

/// A buffer slot's memory, travelling between application and device.
#[derive(Debug)]
pub struct DeviceBuffer {
    index: usize,
    data: Vec<u8>,
    planes: Vec<Plane>,
    pub bytes_used: usize,
    pub timestamp_us: u64,
    pub flags: BufferFlags,
}

impl DeviceBuffer {
    /// Allocate a buffer large enough for all `planes`.
    #[must_use]
    pub fn allocate(index: usize, planes: Vec<Plane>) -> Self {
        let size = planes.iter().map(|p| p.offset + p.len).max().unwrap_or(0);
        Self {
            index,
            data: vec![0; size],
            planes,
            bytes_used: 0,
            timestamp_us: 0,
            flags: BufferFlags::default(),
        }
    }

    /// Empty stand-in left behind when a wrapper gives its buffer back.
    pub(crate) fn detached() -> Self {
        Self {
            index: usize::MAX,
            data: Vec::new(),
            planes: Vec::new(),
            bytes_used: 0,
            timestamp_us: 0,
            flags: BufferFlags::default(),
        }
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// The filled part of the buffer.
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.bytes_used.min(self.data.len())]
    }

    pub fn filled_mut(&mut self) -> &mut [u8] {
        let used = self.bytes_used.min(self.data.len());
        &mut self.data[..used]
    }

    /// The whole allocation, for producers writing in place.
    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Mutable view of plane `n`.
    pub fn plane_mut(&mut self, n: usize) -> Option<&mut [u8]> {
        let plane = *self.planes.get(n)?;
        self.data.get_mut(plane.offset..plane.offset + plane.len)
    }

    /// Copy `payload` in and mark it as the filled region.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidFrame`] if the payload exceeds the slot.
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<(), EncodeError> {
        if payload.len() > self.data.len() {
            return Err(EncodeError::InvalidFrame(format!(
                "payload of {} bytes exceeds buffer of {}",
                payload.len(),
                self.data.len()
            )));
        }
        self.data[..payload.len()].copy_from_slice(payload);
        self.bytes_used = payload.len();
        Ok(())
    }

    /// Reset per-use metadata before handing the buffer out again.
    pub fn reset(&mut self) {
        self.bytes_used = 0;
        self.timestamp_us = 0;
        self.flags = BufferFlags::default();
    }
}

/// Who currently holds a slot's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOwner {
    Application,
    Device,
}

enum Slot {
    Application(DeviceBuffer),
    Device,
}

/// The input side of the queue pair.
///
/// Free slots are tracked by index; buffers the device has finished with
/// come back through `returns` and are reclaimed without blocking.
pub struct InputQueue {
    slots: Vec<Slot>,
    free: VecDeque<usize>,
    returns: Receiver<DeviceBuffer>,
}

impl InputQueue {
    /// Build the ring from the buffers the device allocated.
    ///
    /// # Errors
    ///
    /// Returns a device error if the buffers are not indexed `0..n`.
    pub fn new(buffers: Vec<DeviceBuffer>, returns: Receiver<DeviceBuffer>) -> Result<Self, EncodeError> {
        let mut slots: Vec<Slot> = (0..buffers.len()).map(|_| Slot::Device).collect();
        let mut free = VecDeque::with_capacity(buffers.len());
        for buffer in buffers {
            let index = buffer.index();
            let Some(slot) = slots.get_mut(index) else {
                return Err(EncodeError::device(
                    "input queue setup",
                    format!("buffer index {index} out of range"),
                ));
            };
            if matches!(slot, Slot::Application(_)) {
                return Err(EncodeError::device(
                    "input queue setup",
                    format!("duplicate buffer index {index}"),
                ));
            }
            *slot = Slot::Application(buffer);
            free.push_back(index);
        }
        Ok(Self {
            slots,
            free,
            returns,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn owner(&self, index: usize) -> Option<SlotOwner> {
        self.slots.get(index).map(|s| match s {
            Slot::Application(_) => SlotOwner::Application,
            Slot::Device => SlotOwner::Device,
        })
    }

    /// Number of buffers currently held by the device.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Device)).count()
    }

    /// Move every buffer the device has returned back to the free list.
    ///
    /// # Errors
    ///
    /// Returns a device error if the device returns a buffer it does not
    /// own, or if the return path closed while buffers are still in flight.
    pub fn reclaim(&mut self) -> Result<usize, EncodeError> {
        let mut reclaimed = 0;
        loop {
            match self.returns.try_recv() {
                Ok(mut buffer) => {
                    let index = buffer.index();
                    match self.slots.get_mut(index) {
                        Some(slot @ Slot::Device) => {
                            buffer.reset();
                            *slot = Slot::Application(buffer);
                            self.free.push_back(index);
                            reclaimed += 1;
                        }
                        _ => {
                            return Err(EncodeError::device(
                                "input reclaim",
                                format!("device returned buffer {index} it did not own"),
                            ))
                        }
                    }
                }
                Err(TryRecvError::Empty) => return Ok(reclaimed),
                Err(TryRecvError::Disconnected) => {
                    if self.in_flight() > 0 {
                        return Err(EncodeError::device(
                            "input reclaim",
                            "device return path closed with buffers in flight",
                        ));
                    }
                    return Ok(reclaimed);
                }
            }
        }
    }

    /// Take a free buffer and mark its slot device-owned.
    ///
    /// Tries a non-blocking reclaim first when the free list is empty.
    ///
    /// # Errors
    ///
    /// [`EncodeError::ResourceExhausted`] when nothing can be reclaimed.
    pub fn checkout(&mut self) -> Result<DeviceBuffer, EncodeError> {
        if self.free.is_empty() {
            self.reclaim()?;
        }
        let Some(index) = self.free.pop_front() else {
            return Err(EncodeError::ResourceExhausted {
                in_flight: self.in_flight(),
            });
        };
        match std::mem::replace(&mut self.slots[index], Slot::Device) {
            Slot::Application(buffer) => Ok(buffer),
            Slot::Device => Err(EncodeError::device(
                "input checkout",
                format!("free list held device-owned slot {index}"),
            )),
        }
    }

    /// Give back a buffer that was checked out but never submitted.
    pub fn checkin(&mut self, mut buffer: DeviceBuffer) {
        let index = buffer.index();
        if let Some(slot @ Slot::Device) = self.slots.get_mut(index) {
            buffer.reset();
            *slot = Slot::Application(buffer);
            self.free.push_front(index);
        } else {
            tracing::error!(index, "checkin of a buffer the ring does not track");
        }
    }
}

/// Ownership bookkeeping for the output side.
///
/// The output memory itself always travels inside events and the recycle
/// channel; this only guards against the device delivering a slot twice.
pub struct OutputSlots {
    owners: Vec<SlotOwner>,
}

impl OutputSlots {
    /// All slots start device-owned: they are queued at configuration.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            owners: vec![SlotOwner::Device; count],
        }
    }

    /// Record that the device delivered slot `index`.
    ///
    /// Returns `false` if the slot was not device-owned.
    pub fn delivered(&mut self, index: usize) -> bool {
        match self.owners.get_mut(index) {
            Some(owner @ SlotOwner::Device) => {
                *owner = SlotOwner::Application;
                true
            }
            _ => false,
        }
    }

    /// Record that slot `index` was handed back to the device.
    pub fn requeued(&mut self, index: usize) {
        if let Some(owner) = self.owners.get_mut(index) {
            *owner = SlotOwner::Device;
        }
    }

    #[must_use]
    pub fn owner(&self, index: usize) -> Option<SlotOwner> {
        self.owners.get(index).copied()
    }
}

struct PoolState {
    free: VecDeque<DeviceBuffer>,
    closed: bool,
}

/// Free intermediate buffers shared by two chained queue pairs.
///
/// The forwarding stage blocks in [`take`](Self::take) until the
/// downstream stage [`put`](Self::put)s a buffer back, so no converted
/// frame is ever dropped for lack of space.
pub struct HandoffPool {
    state: Mutex<PoolState>,
    available: Condvar,
}

impl HandoffPool {
    #[must_use]
    pub fn new(buffers: Vec<DeviceBuffer>) -> Self {
        Self {
            state: Mutex::new(PoolState {
                free: buffers.into(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| {
            tracing::warn!("handoff pool mutex was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Block until a buffer is free. Returns `None` once the pool is closed.
    pub fn take(&self) -> Option<DeviceBuffer> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(buffer) = state.free.pop_front() {
                return Some(buffer);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Return a buffer and wake one waiting forwarder.
    pub fn put(&self, mut buffer: DeviceBuffer) {
        buffer.reset();
        let mut state = self.lock();
        state.free.push_back(buffer);
        drop(state);
        self.available.notify_one();
    }

    /// Wake every waiter; subsequent `take`s return `None`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam_channel::unbounded;

    use super::*;

    fn ring(n: usize) -> (InputQueue, crossbeam_channel::Sender<DeviceBuffer>) {
        let (tx, rx) = unbounded();
        let buffers = (0..n).map(|i| DeviceBuffer::allocate(i, Plane::bytes(16))).collect();
        (InputQueue::new(buffers, rx).unwrap(), tx)
    }

    #[test]
    fn i420_layout_aligns_rows() {
        let planes = Plane::i420(100, 50, 32, 16);
        assert_eq!(planes[0].stride, 128);
        assert_eq!(planes[0].rows, 64);
        assert_eq!(planes[1].offset, 128 * 64);
        assert_eq!(planes[1].stride, 64);
        assert_eq!(planes[2].offset, planes[1].offset + 64 * 32);
        let buffer = DeviceBuffer::allocate(0, planes);
        assert_eq!(buffer.capacity(), 128 * 64 * 3 / 2);
    }

    #[test]
    fn checkout_toggles_ownership() {
        let (mut queue, _tx) = ring(2);
        let buffer = queue.checkout().unwrap();
        assert_eq!(queue.owner(buffer.index()), Some(SlotOwner::Device));
        assert_eq!(queue.in_flight(), 1);
        queue.checkin(buffer);
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn exhausted_ring_reports_resource_exhausted() {
        let (mut queue, _tx) = ring(1);
        let _held = queue.checkout().unwrap();
        let err = queue.checkout().unwrap_err();
        assert!(matches!(err, EncodeError::ResourceExhausted { in_flight: 1 }));
    }

    #[test]
    fn checkout_reclaims_returned_buffers() {
        let (mut queue, tx) = ring(1);
        let mut buffer = queue.checkout().unwrap();
        buffer.bytes_used = 7;
        tx.send(buffer).unwrap();
        let again = queue.checkout().unwrap();
        assert_eq!(again.index(), 0);
        assert_eq!(again.bytes_used, 0);
    }

    #[test]
    fn returning_an_application_owned_buffer_is_a_device_error() {
        let (mut queue, tx) = ring(2);
        tx.send(DeviceBuffer::allocate(1, Plane::bytes(16))).unwrap();
        assert!(queue.reclaim().unwrap_err().is_fatal());
    }

    #[test]
    fn output_slots_reject_double_delivery() {
        let mut slots = OutputSlots::new(2);
        assert!(slots.delivered(1));
        assert!(!slots.delivered(1));
        slots.requeued(1);
        assert_eq!(slots.owner(1), Some(SlotOwner::Device));
        assert!(!slots.delivered(5));
    }

    #[test]
    fn handoff_pool_blocks_until_buffer_returns() {
        let pool = Arc::new(HandoffPool::new(vec![DeviceBuffer::allocate(0, Plane::bytes(4))]));
        let first = pool.take().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.take().map(|b| b.index()))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.free_count(), 0);
        pool.put(first);
        assert_eq!(waiter.join().unwrap(), Some(0));
    }

    #[test]
    fn closing_the_pool_wakes_waiters() {
        let pool = Arc::new(HandoffPool::new(Vec::new()));
        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.take().is_none())
        };
        std::thread::sleep(Duration::from_millis(20));
        pool.close();
        assert!(waiter.join().unwrap());
    }
}
