//! E4M3 float8 codec with one f32 scale per row.

/// Largest finite E4M3 magnitude.
pub const E4M3_MAX: f32 = 448.0;

const E4M3_NAN: u8 = 0x7F;
const E4M3_MAX_BITS: u8 = 0x7E;
const SUBNORMAL_STEP: f32 = 1.0 / 512.0; // 2^-9

pub fn f32_to_e4m3(x: f32) -> u8 {
    if x.is_nan() {
        return E4M3_NAN;
    }
    let sign = if x.is_sign_negative() { 0x80 } else { 0x00 };
    let a = x.abs().min(E4M3_MAX);
    if a < SUBNORMAL_STEP / 2.0 {
        return sign;
    }

    let exp = ((a.to_bits() >> 23) & 0xFF) as i32 - 127;
    if exp < -6 {
        // m == 8 lands on the smallest normal, which has the same bit pattern.
        let m = (a / SUBNORMAL_STEP).round() as u8;
        return sign | m;
    }

    let frac = a / 2f32.powi(exp) - 1.0;
    let mut m = (frac * 8.0).round() as i32;
    let mut exp = exp;
    if m == 8 {
        m = 0;
        exp += 1;
    }
    let bits = (((exp + 7) as u32) << 3 | m as u32).min(E4M3_MAX_BITS as u32) as u8;
    sign | bits
}

pub fn e4m3_to_f32(b: u8) -> f32 {
    let sign = if b & 0x80 != 0 { -1.0 } else { 1.0 };
    let exp = ((b >> 3) & 0x0F) as i32;
    let m = (b & 0x07) as f32;
    if exp == 0x0F && b & 0x07 == 0x07 {
        return f32::NAN;
    }
    let mag = if exp == 0 {
        m * SUBNORMAL_STEP
    } else {
        (1.0 + m / 8.0) * 2f32.powi(exp - 7)
    };
    sign * mag
}

fn absmax(values: &[f32]) -> f32 {
    values.iter().fold(0f32, |acc, v| acc.max(v.abs()))
}

pub(crate) fn scale_for(values: &[f32], qmax: f32) -> f32 {
    let m = absmax(values);
    if m == 0.0 || !m.is_finite() {
        1.0
    } else {
        m / qmax
    }
}

pub fn quantize_rows(rows: usize, cols: usize, values: &[f32]) -> (Vec<u8>, Vec<f32>) {
    let mut data = Vec::with_capacity(rows * cols);
    let mut scales = Vec::with_capacity(rows);
    for row in values.chunks_exact(cols).take(rows) {
        let scale = scale_for(row, E4M3_MAX);
        scales.push(scale);
        data.extend(row.iter().map(|&v| f32_to_e4m3(v / scale)));
    }
    (data, scales)
}

pub fn dequantize_rows(cols: usize, data: &[u8], scales: &[f32]) -> Vec<f32> {
    data.chunks_exact(cols)
        .zip(scales)
        .flat_map(|(row, &scale)| row.iter().map(move |&b| e4m3_to_f32(b) * scale))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_encodings() {
        assert_eq!(f32_to_e4m3(0.0), 0x00);
        assert_eq!(f32_to_e4m3(1.0), 0x38);
        assert_eq!(f32_to_e4m3(-1.0), 0xB8);
        assert_eq!(f32_to_e4m3(448.0), 0x7E);
        assert_eq!(f32_to_e4m3(1.0e6), 0x7E);
        assert_eq!(f32_to_e4m3(f32::NAN), 0x7F);
        assert_eq!(e4m3_to_f32(0x7E), 448.0);
        assert_eq!(e4m3_to_f32(0x38), 1.0);
        assert!(e4m3_to_f32(0x7F).is_nan());
    }

    #[test]
    fn test_subnormals() {
        assert_eq!(e4m3_to_f32(0x01), 1.0 / 512.0);
        assert_eq!(f32_to_e4m3(1.0 / 512.0), 0x01);
        assert_eq!(f32_to_e4m3(1.0 / 64.0), 0x08);
        assert_eq!(e4m3_to_f32(0x08), 1.0 / 64.0);
    }

    #[test]
    fn test_every_finite_code_decodes_to_itself() {
        for b in 0u8..=255 {
            let v = e4m3_to_f32(b);
            if v.is_nan() {
                continue;
            }
            let back = f32_to_e4m3(v);
            if v == 0.0 {
                assert_eq!(back & 0x7F, 0);
            } else {
                assert_eq!(back, b, "code {b:#04x} -> {v}");
            }
        }
    }

    #[test]
    fn test_row_scaling_bounds_error() {
        let values: Vec<f32> = (0..64).map(|i| (i as f32 - 32.0) * 0.37).collect();
        let (data, scales) = quantize_rows(2, 32, &values);
        assert_eq!(data.len(), 64);
        assert_eq!(scales.len(), 2);
        let restored = dequantize_rows(32, &data, &scales);
        for (a, b) in values.iter().zip(&restored) {
            // 3 mantissa bits: relative error at most 1/16
            assert!((a - b).abs() <= a.abs() / 16.0 + 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn test_zero_row_keeps_unit_scale() {
        let (data, scales) = quantize_rows(1, 4, &[0.0; 4]);
        assert_eq!(scales, vec![1.0]);
        assert_eq!(data, vec![0; 4]);
    }
}
