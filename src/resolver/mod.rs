//! Applies a validated quantization config to a parameter tree.

pub mod filter;

pub use filter::{should_quantize, ModuleFilter};

use crate::backend::{default_backend, QuantizationBackend};
use crate::core::validation::HIGH_MSE;
use crate::core::{
    reconstruction_mse, LoadOptions, QuantizationConfig, QuantizationReport, Result,
    ValidatedConfig,
};
use crate::model::{DenseTensor, Parameter, ParameterTree, QuantizedModel, QuantizedWeight};
use crate::utils::{cast_bytes, is_linear_weight, is_within, param_key, split_param_key, FloatDtype};
use rayon::prelude::*;
use std::time::Instant;
use tracing::{debug, info, warn};

pub fn validate(config: &QuantizationConfig) -> Result<ValidatedConfig> {
    config.validate()
}

/// Quantizes `tree` with the default backend and no dtype changes.
pub fn apply(
    config: &ValidatedConfig,
    tree: ParameterTree,
) -> Result<(ParameterTree, QuantizationReport)> {
    Resolver::new(config.clone()).apply(tree)
}

enum ModuleOutcome {
    Quantized { mse: f32 },
    Skipped,
    NotCandidate,
}

type ModuleResult = (String, Vec<(String, Parameter)>, ModuleOutcome);

pub struct Resolver {
    filter: ModuleFilter,
    options: LoadOptions,
    backend: Box<dyn QuantizationBackend>,
}

impl Resolver {
    pub fn new(config: ValidatedConfig) -> Self {
        Self::with_options(config, LoadOptions::default())
    }

    pub fn with_options(config: ValidatedConfig, options: LoadOptions) -> Self {
        let filter = ModuleFilter::new(config, options.keep_in_fp32_modules.clone());
        Self {
            filter,
            options,
            backend: default_backend(),
        }
    }

    pub fn with_backend(mut self, backend: Box<dyn QuantizationBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn config(&self) -> &ValidatedConfig {
        self.filter.config()
    }

    pub fn should_quantize(&self, module: &str) -> bool {
        self.filter.should_quantize(module)
    }

    /// Converts every eligible module. Consumes the tree so a failure part
    /// way through leaves nothing half-converted behind.
    pub fn apply(&self, tree: ParameterTree) -> Result<(ParameterTree, QuantizationReport)> {
        let start_time = Instant::now();
        let config = self.filter.config();

        let unmatched = self.filter.unmatched_exclusions(&tree);
        for name in &unmatched {
            warn!("modules_to_not_convert entry {name:?} matches no module in the checkpoint");
        }

        let modules: Vec<(String, Vec<(String, Parameter)>)> =
            tree.into_modules().into_iter().collect();
        info!(
            "Applying {} weight quantization{} to {} modules with the {} backend",
            config.weight_precision,
            config
                .activation_precision
                .map(|a| format!(" ({a} activations)"))
                .unwrap_or_default(),
            modules.len(),
            self.backend.name()
        );

        let results: Vec<ModuleResult> = if self.options.parallel {
            info!("Converting on {} threads", rayon::current_num_threads());
            modules
                .into_par_iter()
                .map(|(module, leaves)| self.process_module(module, leaves))
                .collect::<Result<_>>()?
        } else {
            modules
                .into_iter()
                .map(|(module, leaves)| self.process_module(module, leaves))
                .collect::<Result<_>>()?
        };

        let mut out = ParameterTree::new();
        let mut report = QuantizationReport {
            unmatched_exclusions: unmatched,
            ..Default::default()
        };
        for (module, leaves, outcome) in results {
            match outcome {
                ModuleOutcome::Quantized { mse } => {
                    report.quantized_modules += 1;
                    report.mse_stats.push((module.clone(), mse));
                }
                ModuleOutcome::Skipped => report.skipped_modules += 1,
                ModuleOutcome::NotCandidate => {}
            }
            for (leaf, param) in leaves {
                out.insert(param_key(&module, &leaf), param);
            }
        }

        report.total_time_seconds = start_time.elapsed().as_secs_f32();
        info!(
            "Quantized {} modules, skipped {} in {:.2}s",
            report.quantized_modules, report.skipped_modules, report.total_time_seconds
        );
        Ok((out, report))
    }

    /// Applies the config and wraps the converted tree as a model.
    pub fn into_model(self, tree: ParameterTree) -> Result<(QuantizedModel, QuantizationReport)> {
        let (tree, report) = self.apply(tree)?;
        let dtype = self
            .options
            .dtype
            .or_else(|| dominant_dtype(&tree))
            .unwrap_or(FloatDtype::F32);
        let config = self.filter.config().clone();
        Ok((QuantizedModel::new(tree, Some(config), dtype, self.backend), report))
    }

    fn process_module(
        &self,
        module: String,
        leaves: Vec<(String, Parameter)>,
    ) -> Result<ModuleResult> {
        let is_candidate = leaves.iter().any(|(leaf, param)| match param {
            Parameter::Dense(t) => is_linear_weight(leaf, &t.shape, t.float_dtype()),
            Parameter::Quantized(_) => false,
        });
        let keep_fp32 = self.filter.keeps_fp32(&module);
        let convert = is_candidate && self.filter.should_quantize(&module);
        let target = if keep_fp32 {
            Some(FloatDtype::F32)
        } else {
            self.options.dtype
        };

        let mut mse = None;
        let mut out = Vec::with_capacity(leaves.len());
        for (leaf, param) in leaves {
            let param = match param {
                Parameter::Dense(t) if convert && leaf == "weight" => {
                    let (weight, err) = self.quantize_weight(&module, t)?;
                    mse = Some(err);
                    Parameter::Quantized(weight)
                }
                Parameter::Dense(t) => Parameter::Dense(cast_dense(t, target)?),
                other => other,
            };
            out.push((leaf, param));
        }

        let outcome = match mse {
            Some(mse) => ModuleOutcome::Quantized { mse },
            None if is_candidate => {
                debug!("leaving {module:?} unquantized");
                ModuleOutcome::Skipped
            }
            None => ModuleOutcome::NotCandidate,
        };
        Ok((module, out, outcome))
    }

    fn quantize_weight(&self, module: &str, tensor: DenseTensor) -> Result<(QuantizedWeight, f32)> {
        let config = self.filter.config();
        let (rows, cols) = (tensor.shape[0], tensor.shape[1]);
        let original_dtype = tensor.float_dtype().unwrap_or(FloatDtype::F32);
        let values = tensor.to_f32_vec()?;

        let packed = self
            .backend
            .quantize(module, rows, cols, &values, config.weight_precision)?;
        let weight = QuantizedWeight {
            precision: config.weight_precision,
            activation: config.activation_precision,
            original_dtype,
            shape: tensor.shape,
            data: packed.data,
            scales: packed.scales,
        };

        let restored = self.backend.dequantize(&weight)?;
        let mse = reconstruction_mse(&values, &restored);
        debug!("quantized {module} [{rows} x {cols}] to {}: mse {mse:.6e}", weight.precision);
        if mse > HIGH_MSE {
            warn!("High reconstruction MSE {mse:.4e} for {module}; quantization may be lossy");
        }
        Ok((weight, mse))
    }
}

fn cast_dense(tensor: DenseTensor, target: Option<FloatDtype>) -> Result<DenseTensor> {
    match (tensor.float_dtype(), target) {
        (Some(from), Some(to)) if from != to => {
            let data = cast_bytes(tensor.data, from, to)?;
            DenseTensor::new(to.to_safetensors(), tensor.shape, data)
        }
        _ => Ok(tensor),
    }
}

/// Casts dense floating tensors per `options` without quantizing anything;
/// used for checkpoints that are already quantized or loaded without a config.
pub(crate) fn cast_unquantized(
    tree: ParameterTree,
    options: &LoadOptions,
) -> Result<ParameterTree> {
    if options.dtype.is_none() && options.keep_in_fp32_modules.is_empty() {
        return Ok(tree);
    }
    tree.into_iter()
        .map(|(key, param)| -> Result<(String, Parameter)> {
            let (module, _) = split_param_key(&key);
            let target = if options.keep_in_fp32_modules.iter().any(|m| is_within(module, m)) {
                Some(FloatDtype::F32)
            } else {
                options.dtype
            };
            let param = match param {
                Parameter::Dense(t) => Parameter::Dense(cast_dense(t, target)?),
                other => other,
            };
            Ok((key, param))
        })
        .collect()
}

/// Most common floating dtype among dense tensors. Ties go to the wider
/// format: f32, then bf16, then f16.
pub(crate) fn dominant_dtype(tree: &ParameterTree) -> Option<FloatDtype> {
    fn rank(dtype: FloatDtype) -> u8 {
        match dtype {
            FloatDtype::F32 => 2,
            FloatDtype::BF16 => 1,
            FloatDtype::F16 => 0,
        }
    }

    let mut counts = std::collections::HashMap::new();
    for (_, param) in tree.iter() {
        if let Some(dtype) = param.as_dense().and_then(DenseTensor::float_dtype) {
            *counts.entry(dtype).or_insert(0usize) += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|(dtype, n)| (*n, rank(*dtype)))
        .map(|(dtype, _)| dtype)
}
