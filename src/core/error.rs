//! Error types for configuration, conversion and checkpoint handling.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuantoError {
    /// A precision field holds a value outside its supported set.
    #[error("invalid quantization config: {field} = {value:?}")]
    Config { field: &'static str, value: String },

    #[error("failed to quantize module {module}: {reason}")]
    Conversion { module: String, reason: String },

    #[error("invalid checkpoint: {0}")]
    Checkpoint(String),

    #[error("tensor {name}: {reason}")]
    Shape { name: String, reason: String },

    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("cannot cast a quantized model to {0}; only unquantized models can change dtype")]
    QuantizedCast(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SafeTensor(#[from] safetensors::SafeTensorError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QuantoError>;

impl QuantoError {
    pub(crate) fn conversion(module: impl Into<String>, reason: impl ToString) -> Self {
        Self::Conversion {
            module: module.into(),
            reason: reason.to_string(),
        }
    }
}
