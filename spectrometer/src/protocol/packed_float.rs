//! Packed single-precision floats stored in the EEPROM
//!
//! Each float occupies four bytes with the IEEE-754 binary32 fields spread
//! across them:
//!
//! ```text
//! byte 3: s e7 e6 e5 e4 e3 e2 e1
//! byte 2: e0 m22 .. m16
//! byte 1: m15 .. m8
//! byte 0: m7 .. m0
//! ```

use bytemuck::{Pod, Zeroable};

const EXPONENT_MASK: u32 = 0xFF;
const MANTISSA_MASK: u32 = 0x7F_FFFF;

/// A float as it appears in the EEPROM calibration records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct PackedF32(pub [u8; 4]);

impl PackedF32 {
    /// Pack the sign, exponent and mantissa fields of `value`.
    pub fn from_f32(value: f32) -> Self {
        let bits = value.to_bits();
        let sign = bits >> 31;
        let exponent = (bits >> 23) & EXPONENT_MASK;
        let mantissa = bits & MANTISSA_MASK;

        Self([
            mantissa as u8,
            (mantissa >> 8) as u8,
            (((exponent & 1) << 7) | (mantissa >> 16)) as u8,
            ((sign << 7) | (exponent >> 1)) as u8,
        ])
    }

    /// Reassemble the float. Exact inverse of [`from_f32`](Self::from_f32).
    pub fn to_f32(self) -> f32 {
        let [b0, b1, b2, b3] = self.0.map(u32::from);
        let sign = b3 >> 7;
        let exponent = ((b3 & 0x7F) << 1) | (b2 >> 7);
        let mantissa = ((b2 & 0x7F) << 16) | (b1 << 8) | b0;
        f32::from_bits((sign << 31) | (exponent << 23) | mantissa)
    }
}

impl From<f32> for PackedF32 {
    fn from(value: f32) -> Self {
        Self::from_f32(value)
    }
}

impl From<PackedF32> for f32 {
    fn from(packed: PackedF32) -> Self {
        packed.to_f32()
    }
}
