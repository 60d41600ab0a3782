//! Kernel configuration file format.
//!
//! Loads [`KernelConfig`] from a TOML or JSON file with environment variable
//! overrides via `ELTDROP_*` prefixed variables.

use crate::error::EltDropError;
use crate::types::{DEFAULT_CHUNK_WIDTH, MAX_CHUNK_WIDTH};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which kernel provider the manager should prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelPreference {
    /// Best available provider for the requested chunk width.
    Auto,
    /// Scalar reference kernel only.
    Fallback,
    /// AVX2 kernel; dispatch fails on hosts without AVX2.
    Avx2,
}

impl std::fmt::Display for KernelPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Fallback => write!(f, "fallback"),
            Self::Avx2 => write!(f, "avx2"),
        }
    }
}

impl std::str::FromStr for KernelPreference {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "fallback" | "scalar" => Ok(Self::Fallback),
            "avx2" => Ok(Self::Avx2),
            other => Err(format!("unknown kernel preference: {other}")),
        }
    }
}

/// Kernel configuration loaded from a file with environment variable overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Lanes per RNG chunk and per packed mask chunk.
    /// Override: `ELTDROP_CHUNK_WIDTH`
    pub chunk_width: usize,

    /// Provider selection policy.
    /// Override: `ELTDROP_KERNEL`
    pub preferred_kernel: KernelPreference,

    /// Seed for streams created from this configuration.
    /// Override: `ELTDROP_SEED`
    pub seed: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            chunk_width: DEFAULT_CHUNK_WIDTH,
            preferred_kernel: KernelPreference::Auto,
            seed: 555,
        }
    }
}

/// Errors that can occur when loading or validating a [`KernelConfig`].
#[derive(Debug, thiserror::Error)]
pub enum KernelConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to parse JSON: {0}")]
    ParseJson(#[from] serde_json::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl From<KernelConfigError> for EltDropError {
    fn from(err: KernelConfigError) -> Self {
        EltDropError::Config(err.to_string())
    }
}

impl KernelConfig {
    /// Generate a default configuration TOML string.
    pub fn default_toml() -> String {
        // Three plain scalar fields; serialization cannot fail.
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Load configuration from a file, then apply environment variable
    /// overrides. Files ending in `.json` are parsed as JSON, anything else
    /// as TOML.
    pub fn load(path: &Path) -> Result<Self, KernelConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut cfg: KernelConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            _ => toml::from_str(&contents)?,
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from TOML string (useful for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self, KernelConfigError> {
        let mut cfg: KernelConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, KernelConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), KernelConfigError> {
        if self.chunk_width == 0 {
            return Err(KernelConfigError::Validation("chunk_width must be > 0".into()));
        }
        if self.chunk_width > MAX_CHUNK_WIDTH {
            return Err(KernelConfigError::Validation(format!(
                "chunk_width must be <= {MAX_CHUNK_WIDTH}, got {}",
                self.chunk_width
            )));
        }
        if self.preferred_kernel == KernelPreference::Avx2 && self.chunk_width % 8 != 0 {
            return Err(KernelConfigError::Validation(format!(
                "avx2 kernel needs a chunk_width that is a multiple of 8, got {}",
                self.chunk_width
            )));
        }
        Ok(())
    }

    /// Apply `ELTDROP_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), KernelConfigError> {
        if let Ok(val) = std::env::var("ELTDROP_CHUNK_WIDTH") {
            self.chunk_width = val.parse::<usize>().map_err(|e| KernelConfigError::EnvOverride {
                key: "ELTDROP_CHUNK_WIDTH".into(),
                value: val.clone(),
                reason: e.to_string(),
            })?;
        }

        if let Ok(val) = std::env::var("ELTDROP_KERNEL") {
            self.preferred_kernel =
                val.parse::<KernelPreference>().map_err(|reason| KernelConfigError::EnvOverride {
                    key: "ELTDROP_KERNEL".into(),
                    value: val.clone(),
                    reason,
                })?;
        }

        if let Ok(val) = std::env::var("ELTDROP_SEED") {
            self.seed = val.parse::<u64>().map_err(|e| KernelConfigError::EnvOverride {
                key: "ELTDROP_SEED".into(),
                value: val.clone(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }
}
