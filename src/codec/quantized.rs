//! Quantized float vectors
//!
//! Blendshape weights, joint rotation deltas and body offset vectors travel as
//! signed 16-bit integers scaled by [`SCALE`].

/// Quantization scale: `float = int16 / SCALE`.
pub const SCALE: f32 = 32767.0;

/// Dequantize one value.
#[inline]
pub fn dequantize(value: i16) -> f32 {
    value as f32 / SCALE
}

/// Quantize one value, clamping to `[-1, 1]` first.
#[inline]
pub fn quantize(value: f32) -> i16 {
    if value.is_nan() {
        return 0;
    }
    (value.clamp(-1.0, 1.0) * SCALE).round() as i16
}

/// Dequantize a vector elementwise.
pub fn decode(values: &[i16]) -> Vec<f32> {
    values.iter().copied().map(dequantize).collect()
}

/// Dequantize into an existing buffer, replacing its contents.
pub fn decode_into(values: &[i16], out: &mut Vec<f32>) {
    out.clear();
    out.extend(values.iter().copied().map(dequantize));
}

/// Quantize a vector elementwise.
pub fn encode(values: &[f32]) -> Vec<i16> {
    values.iter().copied().map(quantize).collect()
}

/// Decode little-endian `i16` pairs from raw bytes. A trailing odd byte is ignored.
pub fn decode_le_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes.chunks_exact(2).map(|pair| dequantize(i16::from_le_bytes([pair[0], pair[1]]))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn extremes_map_to_unit_range() {
        assert_eq!(dequantize(32767), 1.0);
        assert_eq!(dequantize(0), 0.0);
        assert!((dequantize(-32767) + 1.0).abs() < f32::EPSILON);
        // i16::MIN sits one step past -1.0
        assert!(dequantize(i16::MIN) < -1.0);
    }

    #[test]
    fn quantize_clamps_out_of_range() {
        assert_eq!(quantize(2.5), 32767);
        assert_eq!(quantize(-7.0), -32767);
        assert_eq!(quantize(f32::NAN), 0);
    }

    #[test]
    fn little_endian_bytes() {
        let bytes = [0xFF, 0x7F, 0x00, 0x00, 0x01];
        let decoded = decode_le_bytes(&bytes);
        assert_eq!(decoded, vec![1.0, 0.0]);
    }

    #[test]
    fn decode_into_reuses_buffer() {
        let mut out = vec![9.0; 8];
        decode_into(&[32767, -32767], &mut out);
        assert_eq!(out.len(), 2);
    }

    proptest! {
        #[test]
        fn requantize_round_trip_within_one_step(
            values in prop::collection::vec(-1.0f32..=1.0f32, 0..256)
        ) {
            let decoded = decode(&encode(&values));
            prop_assert_eq!(decoded.len(), values.len());
            for (original, restored) in values.iter().zip(decoded.iter()) {
                prop_assert!((original - restored).abs() <= 1.0 / SCALE);
            }
        }

        #[test]
        fn dequantize_then_quantize_is_identity(
            raw in prop::collection::vec(-32767i16..=32767i16, 0..256)
        ) {
            prop_assert_eq!(encode(&decode(&raw)), raw);
        }
    }
}
