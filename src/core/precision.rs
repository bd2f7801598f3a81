//! Supported numeric precisions for weights and activations.

use super::error::{QuantoError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightPrecision {
    Float8,
    Int8,
    Int4,
    Int2,
}

/// Activations only support the 8-bit formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationPrecision {
    Float8,
    Int8,
}

impl WeightPrecision {
    pub const ALL: [WeightPrecision; 4] = [Self::Float8, Self::Int8, Self::Int4, Self::Int2];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float8 => "float8",
            Self::Int8 => "int8",
            Self::Int4 => "int4",
            Self::Int2 => "int2",
        }
    }

    pub fn bits(&self) -> usize {
        match self {
            Self::Float8 | Self::Int8 => 8,
            Self::Int4 => 4,
            Self::Int2 => 2,
        }
    }
}

impl ActivationPrecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float8 => "float8",
            Self::Int8 => "int8",
        }
    }
}

impl FromStr for WeightPrecision {
    type Err = QuantoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "float8" => Ok(Self::Float8),
            "int8" => Ok(Self::Int8),
            "int4" => Ok(Self::Int4),
            "int2" => Ok(Self::Int2),
            other => Err(QuantoError::Config {
                field: "weights",
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for ActivationPrecision {
    type Err = QuantoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "float8" => Ok(Self::Float8),
            "int8" => Ok(Self::Int8),
            other => Err(QuantoError::Config {
                field: "activations",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for WeightPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ActivationPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
