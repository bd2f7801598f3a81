//! Core quantization types and functionality.

pub mod error;
pub mod header;
pub mod io;
pub mod precision;
pub mod validation;

pub use error::{QuantoError, Result};
pub use header::{ModuleRecord, QuantizationMetadata, CONFIG_FILE, FORMAT_VERSION, WEIGHTS_FILE};
pub use io::{load_checkpoint_dir, load_checkpoint_file, write_checkpoint, Checkpoint};
pub use precision::{ActivationPrecision, WeightPrecision};
pub use validation::reconstruction_mse;

use crate::utils::FloatDtype;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Declarative quantization settings as a user writes them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    pub weights: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activations: Option<String>,
    #[serde(default)]
    pub modules_to_not_convert: Vec<String>,
}

impl QuantizationConfig {
    pub fn new(weights: impl Into<String>) -> Self {
        Self {
            weights: weights.into(),
            ..Default::default()
        }
    }

    pub fn with_activations(mut self, activations: impl Into<String>) -> Self {
        self.activations = Some(activations.into());
        self
    }

    pub fn with_modules_to_not_convert<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules_to_not_convert = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Checks both precision fields and normalizes the exclusion list.
    pub fn validate(&self) -> Result<ValidatedConfig> {
        let weight_precision = self.weights.parse::<WeightPrecision>()?;
        let activation_precision = self
            .activations
            .as_deref()
            .map(str::parse::<ActivationPrecision>)
            .transpose()?;
        Ok(ValidatedConfig {
            weight_precision,
            activation_precision,
            excluded_module_names: self.modules_to_not_convert.iter().cloned().collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedConfig {
    pub weight_precision: WeightPrecision,
    pub activation_precision: Option<ActivationPrecision>,
    pub excluded_module_names: BTreeSet<String>,
}

impl ValidatedConfig {
    pub fn to_raw(&self) -> QuantizationConfig {
        QuantizationConfig {
            weights: self.weight_precision.to_string(),
            activations: self.activation_precision.map(|p| p.to_string()),
            modules_to_not_convert: self.excluded_module_names.iter().cloned().collect(),
        }
    }
}

/// How the unquantized part of a model is materialized.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Target dtype for unquantized floating tensors; `None` keeps them as stored.
    pub dtype: Option<FloatDtype>,
    /// Modules that stay unquantized and are held in f32.
    pub keep_in_fp32_modules: Vec<String>,
    /// Convert modules on the rayon pool.
    pub parallel: bool,
}

impl LoadOptions {
    pub fn with_dtype(mut self, dtype: FloatDtype) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_keep_in_fp32_modules<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keep_in_fp32_modules = names.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Default)]
pub struct QuantizationReport {
    pub quantized_modules: usize,
    pub skipped_modules: usize,
    pub unmatched_exclusions: Vec<String>,
    pub total_time_seconds: f32,
    pub mse_stats: Vec<(String, f32)>,
}
