//! Parameter storage: dense tensors as loaded, or packed quantized weights.

use crate::core::{ActivationPrecision, QuantoError, Result, WeightPrecision};
use crate::utils::{f32_to_bytes, tensor_to_f32, FloatDtype};
use safetensors::tensor::{Dtype, View};
use std::borrow::Cow;

/// A tensor exactly as it sits in a checkpoint: dtype, shape and
/// little-endian bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl DenseTensor {
    pub fn new(dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel * dtype.size() != data.len() {
            return Err(QuantoError::Shape {
                name: format!("{dtype:?}{shape:?}"),
                reason: format!("expected {} bytes, got {}", numel * dtype.size(), data.len()),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_f32(values: &[f32], shape: Vec<usize>, dtype: FloatDtype) -> Result<Self> {
        Self::new(dtype.to_safetensors(), shape, f32_to_bytes(values, dtype))
    }

    pub fn float_dtype(&self) -> Option<FloatDtype> {
        FloatDtype::from_safetensors(self.dtype)
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        tensor_to_f32(&self.data, self.dtype)
    }
}

impl View for DenseTensor {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedWeight {
    pub precision: WeightPrecision,
    /// Set when the owning module quantizes its inputs at call time.
    pub activation: Option<ActivationPrecision>,
    pub original_dtype: FloatDtype,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
    pub scales: Option<Vec<f32>>,
}

impl QuantizedWeight {
    pub fn dims(&self) -> (usize, usize) {
        match self.shape.as_slice() {
            [rows, cols] => (*rows, *cols),
            _ => (0, 0),
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.data.len() + self.scales.as_ref().map_or(0, |s| s.len() * 4)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    Dense(DenseTensor),
    Quantized(QuantizedWeight),
}

impl Parameter {
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Dense(t) => &t.shape,
            Self::Quantized(q) => &q.shape,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Dense(t) => t.data.len(),
            Self::Quantized(q) => q.size_in_bytes(),
        }
    }

    pub fn as_dense(&self) -> Option<&DenseTensor> {
        match self {
            Self::Dense(t) => Some(t),
            Self::Quantized(_) => None,
        }
    }

    pub fn as_quantized(&self) -> Option<&QuantizedWeight> {
        match self {
            Self::Quantized(q) => Some(q),
            Self::Dense(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_size_is_checked() {
        assert!(DenseTensor::new(Dtype::F32, vec![2, 2], vec![0; 15]).is_err());
        let t = DenseTensor::new(Dtype::BF16, vec![2, 2], vec![0; 8]).unwrap();
        assert_eq!(t.numel(), 4);
        assert_eq!(t.float_dtype(), Some(FloatDtype::BF16));
    }

    #[test]
    fn test_quantized_footprint_counts_scales() {
        let q = QuantizedWeight {
            precision: WeightPrecision::Float8,
            activation: None,
            original_dtype: FloatDtype::F32,
            shape: vec![2, 3],
            data: vec![0; 6],
            scales: Some(vec![1.0, 1.0]),
        };
        assert_eq!(q.dims(), (2, 3));
        assert_eq!(Parameter::Quantized(q).size_in_bytes(), 14);
    }
}
