//! Bit-level serialization cursors.
//!
//! Cyphal serializes values least-significant bit first into a little-endian
//! byte stream. Reading past the end of the buffer yields zero bits, which is
//! how implicit zero extension of truncated payloads works.

/// Largest finite float16 value; larger magnitudes saturate to it.
const F16_MAX: f32 = 65504.0;

/// Converts a single-precision float into IEEE 754 binary16 bits, rounding to nearest even.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
pub fn f32_to_f16_bits(x: f32) -> u16 {
    let bits = x.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let man = bits & 0x007F_FFFF;
    if exp == 0xFF {
        return sign | 0x7C00 | if man == 0 { 0 } else { 0x0200 };
    }
    let e = exp - 127 + 15;
    if e >= 0x1F {
        return sign | 0x7C00;
    }
    if e <= 0 {
        if e < -10 {
            return sign;
        }
        let m = man | 0x0080_0000;
        let shift = (14 - e) as u32;
        let half = 1_u32 << (shift - 1);
        let rem = m & ((1_u32 << shift) - 1);
        let mut h = m >> shift;
        if rem > half || (rem == half && h & 1 == 1) {
            h += 1;
        }
        return sign | h as u16;
    }
    let mut h = ((e as u32) << 10) | (man >> 13);
    let rem = man & 0x1FFF;
    if rem > 0x1000 || (rem == 0x1000 && h & 1 == 1) {
        h += 1;
    }
    sign | h as u16
}

/// Converts IEEE 754 binary16 bits into a single-precision float.
#[must_use]
pub fn f16_bits_to_f32(h: u16) -> f32 {
    let sign = u32::from(h & 0x8000) << 16;
    let exp = u32::from((h >> 10) & 0x1F);
    let man = u32::from(h & 0x03FF);
    let bits = match (exp, man) {
        (0, 0) => sign,
        (0, _) => {
            #[allow(clippy::cast_precision_loss)]
            let magnitude = man as f32 * 2.0_f32.powi(-24);
            return if sign == 0 { magnitude } else { -magnitude };
        }
        (0x1F, 0) => sign | 0x7F80_0000,
        (0x1F, _) => sign | 0x7FC0_0000 | (man << 13),
        _ => sign | ((exp + 112) << 23) | (man << 13),
    };
    f32::from_bits(bits)
}

/// Rounds `offset` up to a multiple of `alignment` bits.
#[must_use]
pub const fn align_up(offset: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        offset
    } else {
        offset.div_ceil(alignment) * alignment
    }
}

/// Appends bit fields to a growing byte buffer.
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bits: usize,
}

impl BitWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bits written so far.
    #[must_use]
    pub const fn bit_length(&self) -> usize {
        self.bits
    }

    /// Writes the `width` least significant bits of `value`.
    pub fn write_bits(&mut self, value: u64, width: u8) {
        for i in 0..u32::from(width) {
            let index = self.bits / 8;
            if index == self.bytes.len() {
                self.bytes.push(0);
            }
            if (value >> i) & 1 == 1 {
                self.bytes[index] |= 1 << (self.bits % 8);
            }
            self.bits += 1;
        }
    }

    /// Writes a single bit.
    pub fn write_bool(&mut self, value: bool) {
        self.write_bits(u64::from(value), 1);
    }

    /// Writes an unsigned integer truncated to `width` bits.
    pub fn write_uint(&mut self, value: u64, width: u8) {
        self.write_bits(value, width);
    }

    /// Writes a two's complement integer truncated to `width` bits.
    #[allow(clippy::cast_sign_loss)]
    pub fn write_int(&mut self, value: i64, width: u8) {
        self.write_bits(value as u64, width);
    }

    /// Writes a float of 16, 32, or 64 bits. Finite float16 values saturate.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_float(&mut self, value: f64, width: u8) {
        match width {
            16 => {
                let x = value as f32;
                let x = if x.is_finite() { x.clamp(-F16_MAX, F16_MAX) } else { x };
                self.write_bits(u64::from(f32_to_f16_bits(x)), 16);
            }
            32 => self.write_bits(u64::from((value as f32).to_bits()), 32),
            _ => self.write_bits(value.to_bits(), 64),
        }
    }

    /// Writes `width` zero bits.
    pub fn skip(&mut self, width: usize) {
        for _ in 0..width {
            self.write_bits(0, 1);
        }
    }

    /// Pads with zero bits up to the next byte boundary.
    pub fn align(&mut self) {
        let target = align_up(self.bits, 8);
        self.skip(target - self.bits);
    }

    /// Writes whole bytes; the cursor need not be aligned.
    pub fn write_bytes(&mut self, data: &[u8]) {
        if self.bits % 8 == 0 {
            self.bytes.extend_from_slice(data);
            self.bits += data.len() * 8;
        } else {
            for b in data {
                self.write_bits(u64::from(*b), 8);
            }
        }
    }

    /// Finishes the buffer, padding the last byte with zeros.
    #[must_use]
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.align();
        self.bytes
    }
}

/// Reads bit fields from a byte slice with implicit zero extension.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    /// Creates a reader positioned at the first bit of `data`.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bits consumed so far, including bits read past the end.
    #[must_use]
    pub const fn bit_position(&self) -> usize {
        self.pos
    }

    /// Whole bytes left after the cursor, assuming it is aligned.
    #[must_use]
    pub const fn remaining_bytes(&self) -> usize {
        self.data.len().saturating_sub(self.pos.div_ceil(8))
    }

    /// Reads `width` bits into the low end of the result.
    pub fn read_bits(&mut self, width: u8) -> u64 {
        let mut out = 0_u64;
        for i in 0..u32::from(width) {
            let byte = self.data.get(self.pos / 8).copied().unwrap_or(0);
            if (byte >> (self.pos % 8)) & 1 == 1 {
                out |= 1 << i;
            }
            self.pos += 1;
        }
        out
    }

    /// Reads one bit.
    pub fn read_bool(&mut self) -> bool {
        self.read_bits(1) == 1
    }

    /// Reads an unsigned integer of `width` bits.
    pub fn read_uint(&mut self, width: u8) -> u64 {
        self.read_bits(width)
    }

    /// Reads a two's complement integer of `width` bits, sign-extending it.
    #[allow(clippy::cast_possible_wrap)]
    pub fn read_int(&mut self, width: u8) -> i64 {
        let raw = self.read_bits(width);
        if width == 0 || width >= 64 {
            return raw as i64;
        }
        let shift = 64 - u32::from(width);
        ((raw << shift) as i64) >> shift
    }

    /// Reads a float of 16, 32, or 64 bits.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_float(&mut self, width: u8) -> f64 {
        match width {
            16 => f64::from(f16_bits_to_f32(self.read_bits(16) as u16)),
            32 => f64::from(f32::from_bits(self.read_bits(32) as u32)),
            _ => f64::from_bits(self.read_bits(64)),
        }
    }

    /// Skips `width` bits.
    pub const fn skip(&mut self, width: usize) {
        self.pos += width;
    }

    /// Moves to the next byte boundary.
    pub const fn align(&mut self) {
        self.pos = align_up(self.pos, 8);
    }

    /// Takes the next `count` bytes as a sub-slice, truncated to what is
    /// available, and advances past all `count` of them.
    pub fn take_bytes(&mut self, count: usize) -> &'a [u8] {
        self.align();
        let start = (self.pos / 8).min(self.data.len());
        let end = start.saturating_add(count).min(self.data.len());
        self.pos += count * 8;
        &self.data[start..end]
    }
}
