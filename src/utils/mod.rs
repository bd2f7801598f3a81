//! Utility functions for tensor bytes and parameter names.

pub mod names;
pub mod tensor_ops;

pub use names::{is_within, param_key, split_param_key};
pub use tensor_ops::{cast_bytes, f32_to_bytes, tensor_to_f32, FloatDtype};

/// A module is a candidate when it owns a 2-D floating-point `weight`.
pub fn is_linear_weight(leaf: &str, shape: &[usize], dtype: Option<FloatDtype>) -> bool {
    leaf == "weight" && shape.len() == 2 && dtype.is_some()
}
