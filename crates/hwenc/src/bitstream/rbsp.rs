//! Raw byte sequence payload helpers: emulation prevention and Exp-Golomb
//! bit access.

use super::BitstreamError;

/// Strip emulation-prevention bytes (`00 00 03` → `00 00`).
#[must_use]
pub fn unescape(escaped: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut zeros = 0;
    for &byte in escaped {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

/// Insert emulation-prevention bytes so no start code appears in a payload.
#[must_use]
pub fn escape(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64);
    let mut zeros = 0;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

/// MSB-first bit reader over an unescaped payload.
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Read one bit.
    ///
    /// # Errors
    ///
    /// [`BitstreamError::Truncated`] past the end of the payload.
    pub fn bit(&mut self) -> Result<bool, BitstreamError> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or(BitstreamError::Truncated)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    /// Read `n` (at most 32) bits as an unsigned value.
    ///
    /// # Errors
    ///
    /// [`BitstreamError::Truncated`] past the end of the payload.
    pub fn bits(&mut self, n: u32) -> Result<u32, BitstreamError> {
        debug_assert!(n <= 32);
        let mut value = 0u32;
        for _ in 0..n {
            value = (value << 1) | u32::from(self.bit()?);
        }
        Ok(value)
    }

    /// Skip `n` bits.
    ///
    /// # Errors
    ///
    /// [`BitstreamError::Truncated`] if fewer than `n` bits remain.
    pub fn skip(&mut self, n: usize) -> Result<(), BitstreamError> {
        if self.pos + n > self.data.len() * 8 {
            return Err(BitstreamError::Truncated);
        }
        self.pos += n;
        Ok(())
    }

    /// Unsigned Exp-Golomb code, `ue(v)`.
    ///
    /// # Errors
    ///
    /// [`BitstreamError::Truncated`] or [`BitstreamError::Malformed`] for
    /// codes longer than 32 bits.
    pub fn ue(&mut self) -> Result<u32, BitstreamError> {
        let mut leading = 0;
        while !self.bit()? {
            leading += 1;
            if leading > 31 {
                return Err(BitstreamError::Malformed("exp-golomb code too long"));
            }
        }
        let suffix = self.bits(leading)?;
        #[allow(clippy::cast_possible_truncation)]
        let value = ((1u64 << leading) - 1 + u64::from(suffix)) as u32;
        Ok(value)
    }

    /// Signed Exp-Golomb code, `se(v)`.
    ///
    /// # Errors
    ///
    /// Same as [`ue`](Self::ue).
    pub fn se(&mut self) -> Result<i32, BitstreamError> {
        let code = self.ue()?;
        #[allow(clippy::cast_possible_wrap)]
        let magnitude = code.div_ceil(2) as i32;
        Ok(if code % 2 == 1 { magnitude } else { -magnitude })
    }
}

/// MSB-first bit writer producing an RBSP with trailing bits.
#[derive(Default)]
pub struct BitWriter {
    out: Vec<u8>,
    current: u8,
    filled: u8,
}

impl BitWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bit(&mut self, bit: bool) {
        self.current = (self.current << 1) | u8::from(bit);
        self.filled += 1;
        if self.filled == 8 {
            self.out.push(self.current);
            self.current = 0;
            self.filled = 0;
        }
    }

    pub fn bits(&mut self, value: u32, n: u32) {
        for i in (0..n).rev() {
            self.bit((value >> i) & 1 == 1);
        }
    }

    pub fn ue(&mut self, value: u32) {
        let coded = u64::from(value) + 1;
        let len = 64 - coded.leading_zeros();
        for _ in 1..len {
            self.bit(false);
        }
        for i in (0..len).rev() {
            self.bit((coded >> i) & 1 == 1);
        }
    }

    pub fn se(&mut self, value: i32) {
        let code = if value > 0 {
            value.unsigned_abs() * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };
        self.ue(code);
    }

    /// Append `rbsp_trailing_bits` and return the payload.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        self.bit(true);
        while self.filled != 0 {
            self.bit(false);
        }
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_removes_prevention_bytes() {
        assert_eq!(unescape(&[0, 0, 3, 1, 0, 0, 3, 0]), vec![0, 0, 1, 0, 0, 0]);
        // A lone 03 not preceded by two zeros is data.
        assert_eq!(unescape(&[0, 3, 0]), vec![0, 3, 0]);
    }

    #[test]
    fn escape_breaks_start_codes() {
        assert_eq!(escape(&[0, 0, 1]), vec![0, 0, 3, 1]);
        assert_eq!(escape(&[0, 0, 0, 0]), vec![0, 0, 3, 0, 0]);
        assert_eq!(unescape(&escape(&[0, 0, 0, 0, 2, 0, 0])), vec![0, 0, 0, 0, 2, 0, 0]);
    }

    #[test]
    fn reads_exp_golomb_values() {
        let mut w = BitWriter::new();
        w.ue(0);
        w.ue(1);
        w.ue(2);
        w.ue(3);
        w.se(-2);
        w.se(3);
        w.bits(0b101, 3);
        let data = w.finish();

        let mut r = BitReader::new(&data);
        assert_eq!(r.ue().unwrap(), 0);
        assert_eq!(r.ue().unwrap(), 1);
        assert_eq!(r.ue().unwrap(), 2);
        assert_eq!(r.ue().unwrap(), 3);
        assert_eq!(r.se().unwrap(), -2);
        assert_eq!(r.se().unwrap(), 3);
        assert_eq!(r.bits(3).unwrap(), 0b101);
        assert!(r.bit().unwrap());
    }

    #[test]
    fn reading_past_end_is_truncated() {
        let mut r = BitReader::new(&[0x00]);
        assert_eq!(r.ue(), Err(BitstreamError::Truncated));
    }
}
