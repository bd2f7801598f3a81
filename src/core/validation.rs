//! Quantization quality checks.

/// Mean squared error between a weight and its dequantized reconstruction.
pub fn reconstruction_mse(original: &[f32], restored: &[f32]) -> f32 {
    if original.is_empty() {
        return 0.0;
    }
    let mut mse = 0f32;
    for (expected, actual) in original.iter().zip(restored.iter()) {
        let diff = expected - actual;
        mse += diff * diff;
    }
    mse / original.len() as f32
}

/// Above this the conversion is flagged as lossy in the logs.
pub const HIGH_MSE: f32 = 1e-2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_is_zero() {
        assert_eq!(reconstruction_mse(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
        assert_eq!(reconstruction_mse(&[], &[]), 0.0);
    }

    #[test]
    fn test_mse_value() {
        assert!((reconstruction_mse(&[1.0, 1.0], &[0.0, 3.0]) - 2.5).abs() < 1e-6);
    }
}
