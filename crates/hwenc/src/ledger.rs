//! Frame parameter ledger.
//!
//! Correlates the metadata of each submitted frame with the output the
//! device eventually produces for it. The device only echoes the capture
//! timestamp back, so everything else (geometry, render/NTP time, rotation,
//! colour space) is parked here between submission and completion.
//!
//! Pushes happen on the submission thread and pops on the delivery thread;
//! the lock is held for the queue operation only.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::frame::{ColorSpace, RawFrame, Rotation};
use crate::StaleFrame;

/// Metadata of one submitted frame, keyed by its capture timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameParams {
    pub width: u32,
    pub height: u32,
    pub render_time_ms: i64,
    pub ntp_time_ms: i64,
    /// Capture timestamp in microseconds; echoed by the device.
    pub timestamp_us: u64,
    pub rotation: Rotation,
    pub color_space: Option<ColorSpace>,
}

impl FrameParams {
    #[must_use]
    pub fn from_frame(frame: &RawFrame) -> Self {
        Self {
            width: frame.width(),
            height: frame.height(),
            render_time_ms: frame.render_time_ms,
            ntp_time_ms: frame.ntp_time_ms,
            timestamp_us: frame.timestamp_us,
            rotation: frame.rotation,
            color_space: frame.color_space,
        }
    }
}

struct LedgerInner {
    entries: VecDeque<FrameParams>,
    capacity: usize,
}

/// FIFO of [`FrameParams`] in submission order.
pub struct FrameParamLedger {
    inner: Mutex<LedgerInner>,
}

impl FrameParamLedger {
    /// Create a ledger that holds at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                entries: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|e| {
            tracing::warn!("ledger mutex was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Resize the bound to the number of frames a new session can hold in
    /// flight. Existing entries are kept; excess ones go on the next push.
    pub fn set_capacity(&self, capacity: usize) {
        self.lock().capacity = capacity.max(1);
    }

    /// Record a submitted frame.
    ///
    /// Returns the evicted oldest entry if the ledger was full, which means
    /// the device silently lost at least that many frames.
    pub fn push(&self, params: FrameParams) -> Option<FrameParams> {
        let mut inner = self.lock();
        let evicted = if inner.entries.len() >= inner.capacity {
            inner.entries.pop_front()
        } else {
            None
        };
        inner.entries.push_back(params);
        drop(inner);

        if let Some(old) = &evicted {
            tracing::warn!(
                timestamp_us = old.timestamp_us,
                "ledger full, evicting parameters of a frame the device never returned"
            );
        }
        evicted
    }

    /// Take the parameters whose key equals the hardware timestamp.
    ///
    /// Entries older than `timestamp_us` belong to frames the device
    /// dropped and are discarded along the way. If the front entry is newer
    /// than `timestamp_us`, it is consumed as well and the output is
    /// reported stale: no parameters are ever attached to the wrong output.
    ///
    /// # Errors
    ///
    /// Returns [`StaleFrame`] when no entry matches.
    pub fn take_matching(&self, timestamp_us: u64) -> Result<FrameParams, StaleFrame> {
        let mut inner = self.lock();
        let mut discarded = 0;
        loop {
            let Some(params) = inner.entries.pop_front() else {
                return Err(StaleFrame {
                    timestamp_us,
                    discarded,
                });
            };
            match params.timestamp_us.cmp(&timestamp_us) {
                std::cmp::Ordering::Less => discarded += 1,
                std::cmp::Ordering::Equal => return Ok(params),
                std::cmp::Ordering::Greater => {
                    return Err(StaleFrame {
                        timestamp_us,
                        discarded: discarded + 1,
                    })
                }
            }
        }
    }

    /// Remove the most recent entry if it carries `timestamp_us`.
    ///
    /// Used when a submission fails after its parameters were recorded.
    pub fn retract(&self, timestamp_us: u64) -> bool {
        let mut inner = self.lock();
        if inner.entries.back().is_some_and(|p| p.timestamp_us == timestamp_us) {
            inner.entries.pop_back();
            true
        } else {
            false
        }
    }

    /// Discard everything (session teardown).
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
