//! Annex-B access unit framing.
//!
//! The device hands back one contiguous buffer per access unit, with each
//! NAL unit introduced by a four-byte `00 00 00 01` start code. Framing
//! records where every unit's payload lives so the transport can packetize
//! without copying.

pub mod h264;
pub mod rbsp;

/// Coded slice of a non-IDR picture.
pub const NAL_SLICE: u8 = 1;
/// Coded slice of an IDR picture.
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// Failures inside the slice-header parser. These never fail a frame; the
/// unit is delivered without a QP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BitstreamError {
    #[error("bitstream ended early")]
    Truncated,

    #[error("malformed bitstream: {0}")]
    Malformed(&'static str),

    #[error("unsupported bitstream feature: {0}")]
    Unsupported(&'static str),

    #[error("slice references unknown {kind} id {id}")]
    MissingParameterSet { kind: &'static str, id: u32 },
}

/// Span of one NAL unit inside an access unit, start code excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit {
    pub offset: usize,
    pub length: usize,
    /// Low five bits of the unit's first byte.
    pub nal_type: u8,
}

impl NalUnit {
    /// This unit's bytes within `data`.
    #[must_use]
    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        data.get(self.offset..self.offset + self.length)
            .unwrap_or_default()
    }
}

/// Result of framing one access unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessUnitLayout {
    pub units: Vec<NalUnit>,
    /// Any unit is an IDR slice.
    pub key_frame: bool,
}

/// Split an access unit at its four-byte start codes.
///
/// A `01` byte following three or more zero bytes opens a new unit; the
/// previous unit is closed where that zero run began, so trailing zero
/// bytes stay out of its payload. Bytes ahead of the
/// first start code are not part of any unit. A buffer without start codes
/// yields no units and is classified as delta.
#[must_use]
pub fn frame_access_unit(data: &[u8]) -> AccessUnitLayout {
    let mut layout = AccessUnitLayout::default();
    let mut zeros = 0usize;
    let mut start: Option<usize> = None;

    for (i, &byte) in data.iter().enumerate() {
        if byte == 0x01 && zeros >= 3 {
            if let Some(open) = start {
                let end = i - zeros;
                layout.units.push(unit(data, open, end.saturating_sub(open)));
            }
            start = Some(i + 1);
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    if let Some(open) = start {
        layout.units.push(unit(data, open, data.len() - open));
    }

    layout.key_frame = layout.units.iter().any(|u| u.nal_type == NAL_IDR);
    layout
}

fn unit(data: &[u8], offset: usize, length: usize) -> NalUnit {
    let nal_type = if length > 0 {
        data.get(offset).map_or(0, |b| b & 0x1F)
    } else {
        0
    };
    NalUnit {
        offset,
        length,
        nal_type,
    }
}
