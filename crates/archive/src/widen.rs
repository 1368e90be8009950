//! Raw payload decoding, including BF16 to F32 widening.
//!
//! BF16 shares the F32 sign and exponent layout, so widening is exact:
//! place the 16-bit word in the high half of a `u32` and reinterpret.
//! Every finite value, both infinities, and NaN payloads survive
//! unchanged.

use half::f16;

use crate::index::Dtype;

/// Widen one BF16 word to the F32 with identical numeric value.
#[must_use]
pub fn bf16_word_to_f32(word: u16) -> f32 {
    f32::from_bits(u32::from(word) << 16)
}

/// A decoded tensor payload.
///
/// BF16 inputs come out as [`TensorData::F32`]; every other dtype keeps
/// its stored representation.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    F16(Vec<f16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
}

impl TensorData {
    /// Dtype of the decoded values. BF16 inputs report `F32` here.
    #[must_use]
    pub const fn dtype(&self) -> Dtype {
        match self {
            Self::F32(_) => Dtype::F32,
            Self::F64(_) => Dtype::F64,
            Self::F16(_) => Dtype::F16,
            Self::I32(_) => Dtype::I32,
            Self::I64(_) => Dtype::I64,
            Self::U8(_) => Dtype::U8,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::F16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::U8(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Self::F32(v) => Some(v),
            _ => None,
        }
    }
}

/// Decode a little-endian payload into typed values.
///
/// The caller must have checked that `bytes.len()` is a multiple of
/// `dtype.size()`; trailing partial elements are dropped.
#[must_use]
pub fn decode(bytes: &[u8], dtype: Dtype) -> TensorData {
    match dtype {
        Dtype::F32 => TensorData::F32(
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        ),
        Dtype::F64 => TensorData::F64(
            bytes
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect(),
        ),
        Dtype::F16 => TensorData::F16(
            bytes
                .chunks_exact(2)
                .map(|b| f16::from_bits(u16::from_le_bytes([b[0], b[1]])))
                .collect(),
        ),
        Dtype::BF16 => TensorData::F32(
            bytes
                .chunks_exact(2)
                .map(|b| bf16_word_to_f32(u16::from_le_bytes([b[0], b[1]])))
                .collect(),
        ),
        Dtype::I32 => TensorData::I32(
            bytes
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        ),
        Dtype::I64 => TensorData::I64(
            bytes
                .chunks_exact(8)
                .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect(),
        ),
        Dtype::U8 => TensorData::U8(bytes.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bf16_widening_is_exact() {
        assert_eq!(bf16_word_to_f32(0x0000), 0.0);
        assert_eq!(bf16_word_to_f32(0x3F80), 1.0);
        assert_eq!(bf16_word_to_f32(0xBF80), -1.0);
        assert_eq!(bf16_word_to_f32(0x4049), 3.140_625);
        assert_eq!(bf16_word_to_f32(0x7F80), f32::INFINITY);
        assert_eq!(bf16_word_to_f32(0xFF80), f32::NEG_INFINITY);
        assert!(bf16_word_to_f32(0x7FC0).is_nan());
        // negative zero keeps its sign bit
        assert!(bf16_word_to_f32(0x8000).is_sign_negative());
        assert_eq!(bf16_word_to_f32(0x8000), 0.0);
    }

    #[test]
    fn bf16_widening_matches_half_crate() {
        for word in (0..=u16::MAX).step_by(17) {
            let expected = half::bf16::from_bits(word).to_f32();
            let got = bf16_word_to_f32(word);
            assert!(
                (expected.is_nan() && got.is_nan()) || expected.to_bits() == got.to_bits(),
                "word {word:#06x}: expected {expected}, got {got}"
            );
        }
    }

    #[test]
    fn decode_bf16_reports_f32() {
        let bytes: Vec<u8> = [0x3F80u16, 0x0000, 0xC000]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let data = decode(&bytes, Dtype::BF16);
        assert_eq!(data.dtype(), Dtype::F32);
        assert_eq!(data.as_f32().unwrap(), &[1.0, 0.0, -2.0]);
    }

    #[test]
    fn decode_fixed_width_types() {
        let f64s: Vec<u8> = 2.5f64.to_le_bytes().to_vec();
        assert_eq!(decode(&f64s, Dtype::F64), TensorData::F64(vec![2.5]));

        let i32s: Vec<u8> = (-7i32).to_le_bytes().to_vec();
        assert_eq!(decode(&i32s, Dtype::I32), TensorData::I32(vec![-7]));

        let i64s: Vec<u8> = i64::MIN.to_le_bytes().to_vec();
        assert_eq!(decode(&i64s, Dtype::I64), TensorData::I64(vec![i64::MIN]));

        assert_eq!(decode(&[3, 1], Dtype::U8), TensorData::U8(vec![3, 1]));
    }

    #[test]
    fn decode_f16_keeps_half_precision() {
        let word = f16::from_f32(1.5).to_bits();
        let data = decode(&word.to_le_bytes(), Dtype::F16);
        assert_eq!(data, TensorData::F16(vec![f16::from_f32(1.5)]));
        assert_eq!(data.dtype(), Dtype::F16);
    }
}
