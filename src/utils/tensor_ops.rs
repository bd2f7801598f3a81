//! Tensor conversion operations.

use crate::core::{QuantoError, Result};
use half::{bf16, f16};
use safetensors::tensor::Dtype;
use std::fmt;
use std::str::FromStr;

/// Floating dtypes a dense parameter may be materialized in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatDtype {
    F32,
    F16,
    BF16,
}

impl FloatDtype {
    pub fn to_safetensors(self) -> Dtype {
        match self {
            Self::F32 => Dtype::F32,
            Self::F16 => Dtype::F16,
            Self::BF16 => Dtype::BF16,
        }
    }

    pub fn from_safetensors(dtype: Dtype) -> Option<Self> {
        match dtype {
            Dtype::F32 => Some(Self::F32),
            Dtype::F16 => Some(Self::F16),
            Dtype::BF16 => Some(Self::BF16),
            _ => None,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }
}

impl FromStr for FloatDtype {
    type Err = QuantoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "f32" | "float32" => Ok(Self::F32),
            "f16" | "float16" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::BF16),
            other => Err(QuantoError::Config {
                field: "dtype",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for FloatDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::F32 => "float32",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
        })
    }
}

pub fn tensor_to_f32(bytes: &[u8], dtype: Dtype) -> Result<Vec<f32>> {
    Ok(match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|chunk| f16::from_le_bytes([chunk[0], chunk[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|chunk| bf16::from_le_bytes([chunk[0], chunk[1]]).to_f32())
            .collect(),
        other => {
            return Err(QuantoError::Checkpoint(format!(
                "unsupported floating dtype {other:?}"
            )))
        }
    })
}

pub fn f32_to_bytes(values: &[f32], dtype: FloatDtype) -> Vec<u8> {
    match dtype {
        FloatDtype::F32 => bytemuck::cast_slice::<f32, u8>(values).to_vec(),
        FloatDtype::F16 => values
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_le_bytes())
            .collect(),
        FloatDtype::BF16 => values
            .iter()
            .flat_map(|&v| bf16::from_f32(v).to_le_bytes())
            .collect(),
    }
}

/// Re-encodes little-endian floating data into `target`, returning the
/// input untouched when the dtype already matches.
pub fn cast_bytes(bytes: Vec<u8>, from: FloatDtype, target: FloatDtype) -> Result<Vec<u8>> {
    if from == target {
        return Ok(bytes);
    }
    let values = tensor_to_f32(&bytes, from.to_safetensors())?;
    Ok(f32_to_bytes(&values, target))
}
