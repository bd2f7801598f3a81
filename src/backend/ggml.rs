//! Default backend: candle's GGML block formats for the integer precisions
//! and a row-scaled E4M3 encoding for float8.

use super::float8;
use super::{PackedWeight, QuantizationBackend};
use crate::core::{QuantoError, Result, WeightPrecision};
use crate::model::QuantizedWeight;
use candle_core::quantized::k_quants::{BlockQ2K, BlockQ4_0, BlockQ8_0};
use candle_core::quantized::GgmlType;
use std::mem;

#[derive(Debug, Default, Clone, Copy)]
pub struct GgmlBackend;

impl GgmlBackend {
    pub fn new() -> Self {
        Self
    }

    /// Elements per block for a precision; float8 has no block constraint.
    pub fn block_size(precision: WeightPrecision) -> usize {
        match precision {
            WeightPrecision::Float8 => 1,
            WeightPrecision::Int8 => BlockQ8_0::BLCK_SIZE,
            WeightPrecision::Int4 => BlockQ4_0::BLCK_SIZE,
            WeightPrecision::Int2 => BlockQ2K::BLCK_SIZE,
        }
    }
}

fn check_row_len(module: &str, cols: usize, block: usize) -> Result<()> {
    if cols == 0 || cols % block != 0 {
        return Err(QuantoError::conversion(
            module,
            format!("row length {cols} is not a positive multiple of block size {block}"),
        ));
    }
    Ok(())
}

fn pack_blocks<T: GgmlType>(
    module: &str,
    rows: usize,
    cols: usize,
    values: &[f32],
) -> Result<Vec<u8>> {
    check_row_len(module, cols, T::BLCK_SIZE)?;
    let mut blocks = vec![T::zeros(); rows * cols / T::BLCK_SIZE];
    T::from_float(values, &mut blocks).map_err(|e| QuantoError::conversion(module, e))?;
    let raw = unsafe {
        std::slice::from_raw_parts(
            blocks.as_ptr() as *const u8,
            blocks.len() * mem::size_of::<T>(),
        )
    };
    Ok(raw.to_vec())
}

fn unpack_blocks<T: GgmlType>(data: &[u8], numel: usize) -> Result<Vec<f32>> {
    let n_blocks = numel / T::BLCK_SIZE;
    if numel % T::BLCK_SIZE != 0 || data.len() != n_blocks * mem::size_of::<T>() {
        return Err(QuantoError::Checkpoint(format!(
            "packed size mismatch: {} bytes for {numel} elements",
            data.len()
        )));
    }
    let mut blocks = vec![T::zeros(); n_blocks];
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), blocks.as_mut_ptr() as *mut u8, data.len());
    }
    let mut out = vec![0f32; numel];
    T::to_float(&blocks, &mut out).map_err(|e| QuantoError::Checkpoint(e.to_string()))?;
    Ok(out)
}

impl QuantizationBackend for GgmlBackend {
    fn quantize(
        &self,
        module: &str,
        rows: usize,
        cols: usize,
        values: &[f32],
        precision: WeightPrecision,
    ) -> Result<PackedWeight> {
        if values.len() != rows * cols {
            return Err(QuantoError::conversion(
                module,
                format!(
                    "expected {} values for [{rows}, {cols}], got {}",
                    rows * cols,
                    values.len()
                ),
            ));
        }
        let data = match precision {
            WeightPrecision::Float8 => {
                check_row_len(module, cols, 1)?;
                let (data, scales) = float8::quantize_rows(rows, cols, values);
                return Ok(PackedWeight {
                    data,
                    scales: Some(scales),
                });
            }
            WeightPrecision::Int8 => pack_blocks::<BlockQ8_0>(module, rows, cols, values)?,
            WeightPrecision::Int4 => pack_blocks::<BlockQ4_0>(module, rows, cols, values)?,
            WeightPrecision::Int2 => pack_blocks::<BlockQ2K>(module, rows, cols, values)?,
        };
        Ok(PackedWeight { data, scales: None })
    }

    fn dequantize(&self, weight: &QuantizedWeight) -> Result<Vec<f32>> {
        if weight.shape.len() != 2 {
            return Err(QuantoError::Checkpoint(format!(
                "quantized weight must be 2-D, found {:?}",
                weight.shape
            )));
        }
        let (rows, cols) = weight.dims();
        let numel = rows.checked_mul(cols).ok_or_else(|| {
            QuantoError::Checkpoint(format!("quantized shape [{rows}, {cols}] overflows"))
        })?;
        if numel == 0 {
            return Ok(Vec::new());
        }
        match weight.precision {
            WeightPrecision::Float8 => {
                let scales = weight.scales.as_deref().ok_or_else(|| {
                    QuantoError::Checkpoint("float8 weight without row scales".to_string())
                })?;
                if weight.data.len() != numel || scales.len() != rows {
                    return Err(QuantoError::Checkpoint(format!(
                        "float8 weight [{rows}, {cols}] has {} bytes and {} scales",
                        weight.data.len(),
                        scales.len()
                    )));
                }
                Ok(float8::dequantize_rows(cols, &weight.data, scales))
            }
            WeightPrecision::Int8 => unpack_blocks::<BlockQ8_0>(&weight.data, numel),
            WeightPrecision::Int4 => unpack_blocks::<BlockQ4_0>(&weight.data, numel),
            WeightPrecision::Int2 => unpack_blocks::<BlockQ2K>(&weight.data, numel),
        }
    }

    fn packed_len(&self, precision: WeightPrecision, rows: usize, cols: usize) -> Option<usize> {
        let numel = rows.checked_mul(cols)?;
        let blocks = numel / Self::block_size(precision);
        match precision {
            WeightPrecision::Float8 => Some(numel),
            WeightPrecision::Int8 => blocks.checked_mul(mem::size_of::<BlockQ8_0>()),
            WeightPrecision::Int4 => blocks.checked_mul(mem::size_of::<BlockQ4_0>()),
            WeightPrecision::Int2 => blocks.checked_mul(mem::size_of::<BlockQ2K>()),
        }
    }

    fn name(&self) -> &'static str {
        "ggml"
    }
}
