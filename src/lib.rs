//! Quantization config resolution and per-module skip filtering for
//! safetensors checkpoints.

pub mod backend;
pub mod core;
pub mod model;
pub mod resolver;
pub mod utils;

// Re-export commonly used types
pub use crate::core::{
    ActivationPrecision, LoadOptions, QuantizationConfig, QuantizationReport, QuantoError, Result,
    ValidatedConfig, WeightPrecision, CONFIG_FILE, WEIGHTS_FILE,
};

pub use backend::{default_backend, GgmlBackend, PackedWeight, QuantizationBackend};
pub use model::{DenseTensor, Parameter, ParameterTree, QuantizedModel, QuantizedWeight};
pub use resolver::{apply, should_quantize, validate, ModuleFilter, Resolver};
pub use utils::FloatDtype;

use crate::core::io::{load_checkpoint_dir, load_checkpoint_file, write_checkpoint, Checkpoint};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Load a model from a directory of safetensors shards, quantizing it with
/// `config` unless the checkpoint is already quantized.
pub fn from_pretrained(
    dir: &Path,
    config: Option<&QuantizationConfig>,
    options: LoadOptions,
) -> Result<QuantizedModel> {
    let validated = config.map(QuantizationConfig::validate).transpose()?;
    let backend = default_backend();
    let checkpoint = load_checkpoint_dir(dir, backend.as_ref())?;
    materialize(checkpoint, validated, options, backend)
}

/// Same as [`from_pretrained`] for one packed checkpoint file.
pub fn from_single_file(
    path: &Path,
    config: Option<&QuantizationConfig>,
    options: LoadOptions,
) -> Result<QuantizedModel> {
    let validated = config.map(QuantizationConfig::validate).transpose()?;
    let backend = default_backend();
    let checkpoint = load_checkpoint_file(path, backend.as_ref())?;
    materialize(checkpoint, validated, options, backend)
}

fn materialize(
    checkpoint: Checkpoint,
    config: Option<ValidatedConfig>,
    options: LoadOptions,
    backend: Box<dyn QuantizationBackend>,
) -> Result<QuantizedModel> {
    if let Some(meta) = checkpoint.metadata {
        if config.is_some() {
            warn!("checkpoint is already quantized; ignoring the supplied quantization config");
        }
        let stored = meta.config.validate()?;
        info!(
            "Restoring {} quantized modules ({} weights)",
            meta.modules.len(),
            stored.weight_precision
        );
        let tree = resolver::cast_unquantized(checkpoint.tree, &options)?;
        let dtype = options
            .dtype
            .or_else(|| resolver::dominant_dtype(&tree))
            .unwrap_or(FloatDtype::F32);
        return Ok(QuantizedModel::new(tree, Some(stored), dtype, backend));
    }

    match config {
        Some(config) => {
            let (model, _) = Resolver::with_options(config, options)
                .with_backend(backend)
                .into_model(checkpoint.tree)?;
            Ok(model)
        }
        None => {
            let tree = resolver::cast_unquantized(checkpoint.tree, &options)?;
            let dtype = options
                .dtype
                .or_else(|| resolver::dominant_dtype(&tree))
                .unwrap_or(FloatDtype::F32);
            Ok(QuantizedModel::new(tree, None, dtype, backend))
        }
    }
}

/// Persist a model so that [`from_pretrained`] restores the same quantized
/// modules without converting again.
pub fn save_pretrained(model: &QuantizedModel, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    write_checkpoint(&dir.join(WEIGHTS_FILE), model.tree(), model.config())?;
    if let Some(config) = model.config() {
        let json = serde_json::to_string_pretty(&config.to_raw())?;
        fs::write(dir.join(CONFIG_FILE), json)?;
    }
    Ok(())
}
