//! Raw frame types handed to the pipeline by the capture collaborator.

use bytes::Bytes;

use crate::EncodeError;

/// Requested or produced frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Skip this frame entirely (nothing is submitted).
    Empty,
    /// Instantaneous decoder refresh.
    Key,
    /// Predicted frame.
    Delta,
}

/// Clockwise rotation to apply at render time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

/// Whether the stream carries camera video or screen content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Unspecified,
    Screenshare,
}

/// Colorimetry attached to a frame and propagated to its encoded output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorSpace {
    /// ISO/IEC 23091-2 colour primaries code point.
    pub primaries: u8,
    /// Transfer characteristics code point.
    pub transfer: u8,
    /// Matrix coefficients code point.
    pub matrix: u8,
    pub full_range: bool,
}

impl ColorSpace {
    /// BT.709 limited range, the common HD camera default.
    #[must_use]
    pub fn bt709() -> Self {
        Self {
            primaries: 1,
            transfer: 1,
            matrix: 1,
            full_range: false,
        }
    }
}

/// Planar I420 picture as produced by a software capture path.
#[derive(Debug, Clone)]
pub struct I420Buffer {
    pub width: u32,
    pub height: u32,
    pub y: Bytes,
    pub u: Bytes,
    pub v: Bytes,
    pub stride_y: usize,
    pub stride_u: usize,
    pub stride_v: usize,
}

impl I420Buffer {
    /// Wrap existing planes, checking that each is large enough for the
    /// declared geometry.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidFrame`] on zero dimensions, strides
    /// narrower than a row, or planes shorter than `stride * rows`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        width: u32,
        height: u32,
        y: Bytes,
        stride_y: usize,
        u: Bytes,
        stride_u: usize,
        v: Bytes,
        stride_v: usize,
    ) -> Result<Self, EncodeError> {
        if width == 0 || height == 0 {
            return Err(EncodeError::InvalidFrame(format!(
                "zero-sized frame {width}x{height}"
            )));
        }
        let buffer = Self {
            width,
            height,
            y,
            u,
            v,
            stride_y,
            stride_u,
            stride_v,
        };
        let (cw, ch) = buffer.chroma_size();
        check_plane("Y", &buffer.y, buffer.stride_y, width as usize, height as usize)?;
        check_plane("U", &buffer.u, buffer.stride_u, cw, ch)?;
        check_plane("V", &buffer.v, buffer.stride_v, cw, ch)?;
        Ok(buffer)
    }

    /// A mid-grey frame with tightly packed planes.
    #[must_use]
    pub fn filled(width: u32, height: u32, luma: u8) -> Self {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        Self {
            width,
            height,
            y: Bytes::from(vec![luma; w * h]),
            u: Bytes::from(vec![128; cw * ch]),
            v: Bytes::from(vec![128; cw * ch]),
            stride_y: w,
            stride_u: cw,
            stride_v: cw,
        }
    }

    /// Chroma plane dimensions (rounded up).
    #[must_use]
    pub fn chroma_size(&self) -> (usize, usize) {
        (
            (self.width as usize).div_ceil(2),
            (self.height as usize).div_ceil(2),
        )
    }
}

fn check_plane(
    name: &str,
    plane: &[u8],
    stride: usize,
    row_bytes: usize,
    rows: usize,
) -> Result<(), EncodeError> {
    if stride < row_bytes {
        return Err(EncodeError::InvalidFrame(format!(
            "{name} stride {stride} narrower than row {row_bytes}"
        )));
    }
    let needed = stride * (rows - 1) + row_bytes;
    if plane.len() < needed {
        return Err(EncodeError::InvalidFrame(format!(
            "{name} plane has {} bytes, needs {needed}",
            plane.len()
        )));
    }
    Ok(())
}

/// Format of an opaque device-native capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeFormat {
    /// Motion-JPEG straight from a UVC camera.
    Mjpeg,
    /// Packed I420 at capture size, to be resized on the device.
    I420,
}

/// Opaque capture buffer that the device converts before encoding.
#[derive(Debug, Clone)]
pub struct NativeBuffer {
    pub format: NativeFormat,
    /// Capture size.
    pub raw_width: u32,
    pub raw_height: u32,
    /// Size the frame is scaled to before encoding.
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// Pixel payload of a raw frame.
#[derive(Debug, Clone)]
pub enum FrameBuffer {
    I420(I420Buffer),
    Native(NativeBuffer),
}

/// One raw frame accepted from the capture collaborator.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub buffer: FrameBuffer,
    /// Capture clock, microseconds, strictly increasing per stream.
    pub timestamp_us: u64,
    pub render_time_ms: i64,
    pub ntp_time_ms: i64,
    pub rotation: Rotation,
    pub color_space: Option<ColorSpace>,
}

impl RawFrame {
    /// Frame with only a capture timestamp; render time is derived from it.
    #[must_use]
    pub fn new(buffer: FrameBuffer, timestamp_us: u64) -> Self {
        #[allow(clippy::cast_possible_wrap)]
        let render_time_ms = (timestamp_us / 1000) as i64;
        Self {
            buffer,
            timestamp_us,
            render_time_ms,
            ntp_time_ms: 0,
            rotation: Rotation::Deg0,
            color_space: None,
        }
    }

    /// Encoded width (the scaled size for native buffers).
    #[must_use]
    pub fn width(&self) -> u32 {
        match &self.buffer {
            FrameBuffer::I420(b) => b.width,
            FrameBuffer::Native(b) => b.width,
        }
    }

    /// Encoded height (the scaled size for native buffers).
    #[must_use]
    pub fn height(&self) -> u32 {
        match &self.buffer {
            FrameBuffer::I420(b) => b.height,
            FrameBuffer::Native(b) => b.height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i420_rejects_short_plane() {
        let err = I420Buffer::new(
            4,
            4,
            Bytes::from(vec![0; 15]),
            4,
            Bytes::from(vec![0; 4]),
            2,
            Bytes::from(vec![0; 4]),
            2,
        )
        .unwrap_err();
        assert!(matches!(err, EncodeError::InvalidFrame(_)));
    }

    #[test]
    fn i420_accepts_padded_stride() {
        let buf = I420Buffer::new(
            3,
            3,
            Bytes::from(vec![0; 8 * 2 + 3]),
            8,
            Bytes::from(vec![0; 4 + 2]),
            4,
            Bytes::from(vec![0; 4 + 2]),
            4,
        )
        .unwrap();
        assert_eq!(buf.chroma_size(), (2, 2));
    }

    #[test]
    fn native_frame_reports_scaled_size() {
        let frame = RawFrame::new(
            FrameBuffer::Native(NativeBuffer {
                format: NativeFormat::Mjpeg,
                raw_width: 1920,
                raw_height: 1080,
                width: 640,
                height: 360,
                data: Bytes::from_static(&[0xFF, 0xD8]),
            }),
            33_000,
        );
        assert_eq!((frame.width(), frame.height()), (640, 360));
        assert_eq!(frame.render_time_ms, 33);
    }
}
