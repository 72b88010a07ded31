/// Errors surfaced by the encoding pipeline.
///
/// Every public operation reports failure through this enum; nothing
/// panics across the crate boundary.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// A hardware negotiation or queue operation failed. Fatal to the
    /// current session: the caller is expected to `release()` and then
    /// `configure()` again.
    #[error("device error during {stage}: {reason}")]
    Device {
        stage: &'static str,
        reason: String,
    },

    /// Encode was attempted before a sink was registered or before
    /// `configure()` succeeded.
    #[error("encoder not initialized: {0}")]
    Uninitialized(&'static str),

    /// No input slot could be reclaimed. Retry on a later frame.
    #[error("no free input buffer ({in_flight} in flight)")]
    ResourceExhausted { in_flight: usize },

    /// The raw frame does not fit the negotiated buffer layout.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The requested backend was not compiled into this build.
    #[error("encoder backend {0} is not available in this build")]
    BackendUnavailable(&'static str),
}

impl EncodeError {
    pub(crate) fn device(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Device {
            stage,
            reason: reason.into(),
        }
    }

    /// Whether the session must be torn down after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Device { .. })
    }
}

/// Ledger correlation found no parameters for a hardware timestamp.
///
/// This is an expected occasional outcome (the device dropped or
/// reordered a frame), so it is logged and counted but never returned to
/// the caller of `encode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("frame parameters not found for timestamp {timestamp_us}us ({discarded} stale entries dropped)")]
pub struct StaleFrame {
    pub timestamp_us: u64,
    pub discarded: usize,
}

/// Returned by an [`EncodedSink`](crate::EncodedSink) that could not accept
/// an encoded unit.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("encoded unit rejected: {0}")]
    Rejected(String),

    #[error("sink channel closed")]
    Closed,
}
