//! Numeric conversion backends.

pub mod activation;
pub mod float8;
pub mod ggml;

pub use activation::fake_quantize;
pub use ggml::GgmlBackend;

use crate::core::{Result, WeightPrecision};
use crate::model::QuantizedWeight;

/// Packed bytes for one weight plus optional per-row scales.
#[derive(Debug, Clone)]
pub struct PackedWeight {
    pub data: Vec<u8>,
    pub scales: Option<Vec<f32>>,
}

pub trait QuantizationBackend: Send + Sync {
    /// Convert a row-major `[rows, cols]` weight to `precision`
    fn quantize(
        &self,
        module: &str,
        rows: usize,
        cols: usize,
        values: &[f32],
        precision: WeightPrecision,
    ) -> Result<PackedWeight>;

    fn dequantize(&self, weight: &QuantizedWeight) -> Result<Vec<f32>>;

    /// Byte length of the packed payload for a well-formed weight, `None`
    /// when the shape overflows
    fn packed_len(&self, precision: WeightPrecision, rows: usize, cols: usize) -> Option<usize>;

    /// Get backend name for logging
    fn name(&self) -> &'static str;
}

pub fn default_backend() -> Box<dyn QuantizationBackend> {
    Box::new(GgmlBackend::new())
}
