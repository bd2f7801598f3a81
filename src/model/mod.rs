//! Parameter trees and the loaded, possibly quantized, model.

pub mod tensor;
pub mod tree;

pub use tensor::{DenseTensor, Parameter, QuantizedWeight};
pub use tree::ParameterTree;

use crate::backend::{default_backend, fake_quantize, QuantizationBackend};
use crate::core::{ActivationPrecision, QuantoError, Result, ValidatedConfig, WeightPrecision};
use crate::utils::{cast_bytes, param_key, FloatDtype};

pub struct QuantizedModel {
    tree: ParameterTree,
    config: Option<ValidatedConfig>,
    dtype: FloatDtype,
    backend: Box<dyn QuantizationBackend>,
}

impl std::fmt::Debug for QuantizedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantizedModel")
            .field("params", &self.tree.len())
            .field("config", &self.config)
            .field("dtype", &self.dtype)
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl QuantizedModel {
    pub fn new(
        tree: ParameterTree,
        config: Option<ValidatedConfig>,
        dtype: FloatDtype,
        backend: Box<dyn QuantizationBackend>,
    ) -> Self {
        Self {
            tree,
            config,
            dtype,
            backend,
        }
    }

    /// Wraps an unquantized tree.
    pub fn dense(tree: ParameterTree, dtype: FloatDtype) -> Self {
        Self::new(tree, None, dtype, default_backend())
    }

    pub fn tree(&self) -> &ParameterTree {
        &self.tree
    }

    pub fn config(&self) -> Option<&ValidatedConfig> {
        self.config.as_ref()
    }

    pub fn dtype(&self) -> FloatDtype {
        self.dtype
    }

    pub fn backend(&self) -> &dyn QuantizationBackend {
        self.backend.as_ref()
    }

    pub fn memory_footprint(&self) -> usize {
        self.tree.size_in_bytes()
    }

    fn quantized_weight(&self, module: &str) -> Option<&QuantizedWeight> {
        self.tree.weight(module).and_then(Parameter::as_quantized)
    }

    pub fn is_quantized(&self, module: &str) -> bool {
        self.quantized_weight(module).is_some()
    }

    pub fn module_precision(&self, module: &str) -> Option<WeightPrecision> {
        self.quantized_weight(module).map(|q| q.precision)
    }

    pub fn activation_precision(&self, module: &str) -> Option<ActivationPrecision> {
        self.quantized_weight(module).and_then(|q| q.activation)
    }

    pub fn quantized_modules(&self) -> Vec<&str> {
        self.tree
            .modules()
            .into_iter()
            .filter(|m| self.is_quantized(m))
            .collect()
    }

    pub fn has_quantized_modules(&self) -> bool {
        self.tree
            .iter()
            .any(|(_, p)| matches!(p, Parameter::Quantized(_)))
    }

    /// Casts every floating dense tensor. Refused once any module is
    /// quantized, since packed weights have a fixed numeric format.
    pub fn to_dtype(&mut self, dtype: FloatDtype) -> Result<()> {
        if dtype == self.dtype {
            return Ok(());
        }
        if self.has_quantized_modules() {
            return Err(QuantoError::QuantizedCast(dtype.to_string()));
        }
        let tree = std::mem::take(&mut self.tree);
        let mut out = ParameterTree::new();
        for (key, param) in tree {
            let param = match param {
                Parameter::Dense(t) => match t.float_dtype() {
                    Some(from) => {
                        let data = cast_bytes(t.data, from, dtype)?;
                        Parameter::Dense(DenseTensor::new(dtype.to_safetensors(), t.shape, data)?)
                    }
                    None => Parameter::Dense(t),
                },
                other => other,
            };
            out.insert(key, param);
        }
        self.tree = out;
        self.dtype = dtype;
        Ok(())
    }

    /// Full-precision view of a module's weight, dequantizing if needed.
    pub fn weight_f32(&self, module: &str) -> Result<Vec<f32>> {
        match self.tree.weight(module) {
            Some(Parameter::Dense(t)) => t.to_f32_vec(),
            Some(Parameter::Quantized(q)) => self.backend.dequantize(q),
            None => Err(QuantoError::UnknownModule(module.to_string())),
        }
    }

    /// Reference linear layer: `y = x·Wᵀ + b` over a `[batch, in]` input.
    pub fn linear(&self, module: &str, input: &[f32], batch: usize) -> Result<Vec<f32>> {
        let weight = self
            .tree
            .weight(module)
            .ok_or_else(|| QuantoError::UnknownModule(module.to_string()))?;
        let (out_features, in_features) = match weight.shape() {
            [_, 0] => {
                return Err(QuantoError::Shape {
                    name: param_key(module, "weight"),
                    reason: "linear weight has no input features".to_string(),
                })
            }
            [o, i] => (*o, *i),
            shape => {
                return Err(QuantoError::Shape {
                    name: param_key(module, "weight"),
                    reason: format!("linear weight must be 2-D, got {shape:?}"),
                })
            }
        };
        if input.len() != batch * in_features {
            return Err(QuantoError::Shape {
                name: module.to_string(),
                reason: format!(
                    "input has {} values, expected {batch} x {in_features}",
                    input.len()
                ),
            });
        }

        let w = self.weight_f32(module)?;
        let bias = match self.tree.get(&param_key(module, "bias")) {
            Some(Parameter::Dense(b)) => Some(b.to_f32_vec()?),
            _ => None,
        };
        if bias.as_ref().is_some_and(|b| b.len() != out_features) {
            return Err(QuantoError::Shape {
                name: param_key(module, "bias"),
                reason: format!("expected {out_features} values"),
            });
        }
        let x = match self.activation_precision(module) {
            Some(precision) => fake_quantize(input, precision),
            None => input.to_vec(),
        };

        let mut out = vec![0f32; batch * out_features];
        for (b, x_row) in x.chunks_exact(in_features).enumerate() {
            for (o, w_row) in w.chunks_exact(in_features).enumerate() {
                let dot: f32 = x_row.iter().zip(w_row).map(|(a, b)| a * b).sum();
                out[b * out_features + o] = dot + bias.as_ref().map_or(0.0, |v| v[o]);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense_model() -> QuantizedModel {
        let mut tree = ParameterTree::new();
        tree.insert_dense(
            "fc.weight",
            DenseTensor::from_f32(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2], FloatDtype::F32)
                .unwrap(),
        );
        tree.insert_dense(
            "fc.bias",
            DenseTensor::from_f32(&[0.5, 0.0, -1.0], vec![3], FloatDtype::F32).unwrap(),
        );
        QuantizedModel::dense(tree, FloatDtype::F32)
    }

    #[test]
    fn test_linear_forward() {
        let model = dense_model();
        let y = model.linear("fc", &[2.0, 3.0, -1.0, 1.0], 2).unwrap();
        assert_eq!(y, vec![2.5, 3.0, 4.0, -0.5, 1.0, -1.0]);
    }

    #[test]
    fn test_linear_rejects_bad_input() {
        let model = dense_model();
        assert!(matches!(model.linear("fc", &[1.0; 3], 1), Err(QuantoError::Shape { .. })));
        assert!(matches!(model.linear("nope", &[1.0; 2], 1), Err(QuantoError::UnknownModule(_))));
    }

    #[test]
    fn test_linear_rejects_zero_width_weight() {
        let mut tree = ParameterTree::new();
        let empty = DenseTensor::from_f32(&[], vec![2, 0], FloatDtype::F32).unwrap();
        tree.insert_dense("empty.weight", empty);
        let model = QuantizedModel::dense(tree, FloatDtype::F32);
        assert!(matches!(model.linear("empty", &[], 1), Err(QuantoError::Shape { .. })));
        assert!(matches!(model.linear("empty", &[], 0), Err(QuantoError::Shape { .. })));
    }

    #[test]
    fn test_dense_model_casts() {
        let mut model = dense_model();
        let before = model.memory_footprint();
        model.to_dtype(FloatDtype::BF16).unwrap();
        assert_eq!(model.dtype(), FloatDtype::BF16);
        assert_eq!(model.memory_footprint() * 2, before);
        // small integers survive bf16 exactly
        let y = model.linear("fc", &[2.0, 3.0], 1).unwrap();
        assert_eq!(y, vec![2.5, 3.0, 4.0]);
    }
}
