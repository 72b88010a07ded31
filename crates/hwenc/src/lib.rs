//! Hardware-accelerated H.264 encoding pipeline.
//!
//! Raw frames go into a [`Pipeline`], which copies them into device input
//! slots and records their parameters in a [`FrameParamLedger`]. The device
//! completes asynchronously; a single delivery thread correlates each output
//! with its frame by timestamp, frames the access unit, extracts the slice
//! QP, hands the [`EncodedUnit`] to the registered [`EncodedSink`] and feeds
//! the [`RateAdjuster`].
//!
//! Backends implement [`HardwareEncoder`]: the in-process loopback device
//! model and, with the `gstreamer` feature, Jetson (`nvv4l2h264enc`) and
//! VideoCore (`v4l2h264enc`) encoders.

pub mod backend;
pub mod bitstream;
pub mod config;
mod delivery;
mod error;
pub mod frame;
pub mod ledger;
pub mod pipeline;
pub mod platform;
pub mod queue;
pub mod rate;
pub mod session;

pub use backend::{BackendKind, EncoderCapabilities, HardwareEncoder, Profile};
pub use config::EncoderConfig;
pub use delivery::{ChannelSink, EncodedSink, EncodedUnit, OwnedEncodedUnit};
pub use error::{EncodeError, SinkError, StaleFrame};
pub use frame::{FrameBuffer, FrameType, I420Buffer, NativeBuffer, RawFrame};
pub use ledger::{FrameParamLedger, FrameParams};
pub use pipeline::{EncoderSettings, Pipeline, PipelineOptions, StatsSnapshot};
pub use rate::RateAdjuster;
pub use session::SessionState;
