//! Tags describing element representations, mask encodings and pass direction.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Chunk width used when nothing else is configured.
pub const DEFAULT_CHUNK_WIDTH: usize = 16;

/// Widest chunk a packed mask chunk can hold (one `u64` of lane bits).
pub const MAX_CHUNK_WIDTH: usize = 64;

/// Numeric representation of a buffer element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// IEEE-754 binary32.
    F32,
    /// Upper 16 bits of a binary32 (bfloat16).
    BF16,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::F32 => write!(f, "f32"),
            DataType::BF16 => write!(f, "bf16"),
        }
    }
}

impl std::str::FromStr for DataType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "f32" | "fp32" => Ok(Self::F32),
            "bf16" => Ok(Self::BF16),
            other => Err(format!("unknown data type: {other}")),
        }
    }
}

/// How the keep/drop decisions of a forward pass are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskMode {
    /// No mask is written.
    None,
    /// One element per lane holding the applied scale (`1/(1-p)` or `0`).
    Explicit,
    /// One bit per lane, packed per chunk, low bit first.
    Bitmask,
}

impl MaskMode {
    pub fn writes_mask(self) -> bool {
        !matches!(self, MaskMode::None)
    }
}

impl fmt::Display for MaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaskMode::None => write!(f, "none"),
            MaskMode::Explicit => write!(f, "explicit"),
            MaskMode::Bitmask => write!(f, "bitmask"),
        }
    }
}

/// Direction of the transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pass {
    Forward,
    Backward,
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pass::Forward => write!(f, "forward"),
            Pass::Backward => write!(f, "backward"),
        }
    }
}
