//! Safetensors checkpoint reading and writing, including packed weights.

use super::header::{
    ModuleRecord, QuantizationMetadata, FORMAT_VERSION, KEY_CONFIG, KEY_FORMAT, KEY_MODULES,
    KEY_VERSION, SCALE_SUFFIX,
};
use super::{QuantoError, Result, ValidatedConfig, WeightPrecision};
use crate::backend::QuantizationBackend;
use crate::model::{DenseTensor, Parameter, ParameterTree, QuantizedWeight};
use crate::utils::{f32_to_bytes, param_key, tensor_to_f32, FloatDtype};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Raw checkpoint contents: tensors plus quantization metadata when the
/// checkpoint was written after conversion.
#[derive(Debug, Default)]
pub struct Checkpoint {
    pub tree: ParameterTree,
    pub metadata: Option<QuantizationMetadata>,
}

fn read_quantization_metadata(
    header: &HashMap<String, String>,
) -> Result<Option<QuantizationMetadata>> {
    let Some(modules) = header.get(KEY_MODULES) else {
        return Ok(None);
    };
    let version = match header.get(KEY_VERSION) {
        Some(v) => v
            .parse::<u32>()
            .map_err(|_| QuantoError::Checkpoint(format!("bad {KEY_VERSION} {v:?}")))?,
        None => FORMAT_VERSION,
    };
    if version > FORMAT_VERSION {
        return Err(QuantoError::Checkpoint(format!(
            "format version {version} is newer than supported {FORMAT_VERSION}"
        )));
    }
    let config = header
        .get(KEY_CONFIG)
        .ok_or_else(|| QuantoError::Checkpoint(format!("{KEY_MODULES} without {KEY_CONFIG}")))?;
    Ok(Some(QuantizationMetadata {
        version,
        config: serde_json::from_str(config)?,
        modules: serde_json::from_str(modules)?,
    }))
}

pub fn load_checkpoint_file(path: &Path, backend: &dyn QuantizationBackend) -> Result<Checkpoint> {
    if !path.is_file() {
        return Err(QuantoError::Checkpoint(format!("no such file: {}", path.display())));
    }
    let bytes = fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&bytes)?;
    let metadata = match header.metadata() {
        Some(map) => read_quantization_metadata(map)?,
        None => None,
    };
    let st = SafeTensors::deserialize(&bytes)?;
    debug!("{}: {} tensors", path.display(), st.len());

    let mut dense: BTreeMap<String, DenseTensor> = BTreeMap::new();
    for (name, view) in st.tensors() {
        let tensor = DenseTensor::new(view.dtype(), view.shape().to_vec(), view.data().to_vec())?;
        dense.insert(name, tensor);
    }

    let mut tree = ParameterTree::new();
    if let Some(meta) = &metadata {
        for (module, record) in &meta.modules {
            let weight = take_quantized(&mut dense, module, record, backend)?;
            tree.insert(param_key(module, "weight"), Parameter::Quantized(weight));
        }
    }
    for (name, tensor) in dense {
        tree.insert_dense(name, tensor);
    }
    Ok(Checkpoint { tree, metadata })
}

fn take_quantized(
    dense: &mut BTreeMap<String, DenseTensor>,
    module: &str,
    record: &ModuleRecord,
    backend: &dyn QuantizationBackend,
) -> Result<QuantizedWeight> {
    let key = param_key(module, "weight");
    let corrupt = |reason: String| QuantoError::Checkpoint(format!("{key}: {reason}"));

    let packed = dense
        .remove(&key)
        .ok_or_else(|| corrupt("listed as quantized but missing".to_string()))?;
    if packed.dtype != Dtype::U8 {
        return Err(corrupt(format!("packed weight must be U8, found {:?}", packed.dtype)));
    }
    let (rows, cols) = match record.shape.as_slice() {
        [rows, cols] => (*rows, *cols),
        other => return Err(corrupt(format!("quantized shape must be 2-D, found {other:?}"))),
    };
    let expected = backend
        .packed_len(record.weights, rows, cols)
        .ok_or_else(|| corrupt(format!("quantized shape [{rows}, {cols}] overflows")))?;
    if packed.data.len() != expected {
        return Err(corrupt(format!(
            "{} packed bytes, expected {expected} for {} [{rows}, {cols}]",
            packed.data.len(),
            record.weights
        )));
    }

    let scales = match record.weights {
        WeightPrecision::Float8 => {
            let scale_key = param_key(module, SCALE_SUFFIX);
            let t = dense
                .remove(&scale_key)
                .ok_or_else(|| corrupt(format!("missing {scale_key}")))?;
            let scales = tensor_to_f32(&t.data, t.dtype)?;
            if scales.len() != rows {
                return Err(corrupt(format!("{} row scales for {rows} rows", scales.len())));
            }
            Some(scales)
        }
        _ => None,
    };
    let original_dtype = record.dtype.parse::<FloatDtype>().map_err(|_| {
        corrupt(format!("unknown original dtype {:?}", record.dtype))
    })?;

    Ok(QuantizedWeight {
        precision: record.weights,
        activation: record.activations,
        original_dtype,
        shape: record.shape.clone(),
        data: packed.data,
        scales,
    })
}

fn safetensors_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "safetensors") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Loads every `*.safetensors` shard in `dir` into a single tree.
pub fn load_checkpoint_dir(dir: &Path, backend: &dyn QuantizationBackend) -> Result<Checkpoint> {
    if !dir.is_dir() {
        return Err(QuantoError::Checkpoint(format!("no such directory: {}", dir.display())));
    }
    let files = safetensors_files(dir)?;
    if files.is_empty() {
        return Err(QuantoError::Checkpoint(format!(
            "no .safetensors files in {}",
            dir.display()
        )));
    }

    let mut merged = Checkpoint::default();
    for file in &files {
        let shard = load_checkpoint_file(file, backend)?;
        for (key, param) in shard.tree {
            if merged.tree.insert(key.clone(), param).is_some() {
                return Err(QuantoError::Checkpoint(format!(
                    "tensor {key} appears in more than one shard"
                )));
            }
        }
        if let Some(meta) = shard.metadata {
            match merged.metadata.as_mut() {
                Some(acc) if acc.config != meta.config => {
                    return Err(QuantoError::Checkpoint(format!(
                        "{} disagrees with earlier shards on the quantization config",
                        file.display()
                    )));
                }
                Some(acc) => acc.modules.extend(meta.modules),
                None => merged.metadata = Some(meta),
            }
        }
    }
    info!(
        "Loaded {} tensors from {} shard(s) in {}",
        merged.tree.len(),
        files.len(),
        dir.display()
    );
    Ok(merged)
}

/// Writes `tree` to one safetensors file. Quantized weights are stored as
/// flat U8 tensors and described in the header so they reload without
/// reconversion. A config is always recorded when given, even if it
/// excluded every module.
pub fn write_checkpoint(
    path: &Path,
    tree: &ParameterTree,
    config: Option<&ValidatedConfig>,
) -> Result<()> {
    let mut tensors: Vec<(String, DenseTensor)> = Vec::with_capacity(tree.len());
    let mut modules: BTreeMap<String, ModuleRecord> = BTreeMap::new();

    for (key, param) in tree.iter() {
        match param {
            Parameter::Dense(t) => tensors.push((key.clone(), t.clone())),
            Parameter::Quantized(q) => {
                let module = key.strip_suffix(".weight").unwrap_or("");
                tensors.push((
                    key.clone(),
                    DenseTensor::new(Dtype::U8, vec![q.data.len()], q.data.clone())?,
                ));
                if let Some(scales) = &q.scales {
                    let bytes = f32_to_bytes(scales, FloatDtype::F32);
                    tensors.push((
                        param_key(module, SCALE_SUFFIX),
                        DenseTensor::new(Dtype::F32, vec![scales.len()], bytes)?,
                    ));
                }
                modules.insert(
                    module.to_string(),
                    ModuleRecord {
                        weights: q.precision,
                        activations: q.activation,
                        dtype: q.original_dtype.to_string(),
                        shape: q.shape.clone(),
                    },
                );
            }
        }
    }

    let mut header = HashMap::new();
    header.insert(KEY_FORMAT.to_string(), "pt".to_string());
    match config {
        Some(config) => {
            header.insert(KEY_VERSION.to_string(), FORMAT_VERSION.to_string());
            header.insert(KEY_CONFIG.to_string(), serde_json::to_string(&config.to_raw())?);
            header.insert(KEY_MODULES.to_string(), serde_json::to_string(&modules)?);
        }
        None if !modules.is_empty() => {
            return Err(QuantoError::Checkpoint(
                "quantized tensors need a config to be saved".to_string(),
            ));
        }
        None => {}
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    safetensors::serialize_to_file(tensors, &Some(header), path)?;
    info!(
        "Wrote {} tensors ({} quantized) to {}",
        tree.len(),
        modules.len(),
        path.display()
    );
    Ok(())
}
