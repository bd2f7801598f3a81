//! Dynamic per-tensor activation quantization applied at call time.

use super::float8::{e4m3_to_f32, f32_to_e4m3, scale_for, E4M3_MAX};
use crate::core::ActivationPrecision;

const INT8_QMAX: f32 = 127.0;

/// Rounds `input` through the given activation format and back to f32.
pub fn fake_quantize(input: &[f32], precision: ActivationPrecision) -> Vec<f32> {
    match precision {
        ActivationPrecision::Int8 => {
            let scale = scale_for(input, INT8_QMAX);
            input
                .iter()
                .map(|&x| (x / scale).round().clamp(-INT8_QMAX, INT8_QMAX) * scale)
                .collect()
        }
        ActivationPrecision::Float8 => {
            let scale = scale_for(input, E4M3_MAX);
            input
                .iter()
                .map(|&x| e4m3_to_f32(f32_to_e4m3(x / scale)) * scale)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int8_snaps_to_grid() {
        let input = [1.27, 0.004, -0.636];
        let out = fake_quantize(&input, ActivationPrecision::Int8);
        assert!((out[0] - 1.27).abs() < 1e-6);
        assert_eq!(out[1], 0.0);
        assert!((out[2] + 0.64).abs() < 1e-5);
    }

    #[test]
    fn test_float8_preserves_absmax() {
        let input = [3.0, -0.1, 0.75];
        let out = fake_quantize(&input, ActivationPrecision::Float8);
        assert!((out[0] - 3.0).abs() < 1e-5);
        assert!((out[2] - 0.75).abs() < 0.75 / 16.0);
    }

    #[test]
    fn test_zero_input_is_stable() {
        let out = fake_quantize(&[0.0, 0.0], ActivationPrecision::Int8);
        assert_eq!(out, vec![0.0, 0.0]);
    }
}
