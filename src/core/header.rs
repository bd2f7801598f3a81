//! Checkpoint metadata stored in the safetensors `__metadata__` header.

use super::{ActivationPrecision, QuantizationConfig, WeightPrecision};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const FORMAT_VERSION: u32 = 1;

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const CONFIG_FILE: &str = "quantization_config.json";

pub const KEY_FORMAT: &str = "format";
pub const KEY_VERSION: &str = "quanto_format_version";
pub const KEY_CONFIG: &str = "quantization_config";
pub const KEY_MODULES: &str = "quantized_modules";

/// Suffix of the per-row scale tensor stored next to float8 weights.
pub const SCALE_SUFFIX: &str = "weight_scale";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub weights: WeightPrecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activations: Option<ActivationPrecision>,
    /// Dtype of the weight before conversion.
    pub dtype: String,
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizationMetadata {
    pub version: u32,
    pub config: QuantizationConfig,
    pub modules: BTreeMap<String, ModuleRecord>,
}
