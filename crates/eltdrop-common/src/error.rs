//! Error types for eltdrop

use thiserror::Error;

/// Main error type for eltdrop operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EltDropError {
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Kernel-specific errors
///
/// Every variant is raised before a kernel touches caller memory: either at
/// dispatch time or by the argument checks that precede a call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("Precondition violated: {reason}")]
    PreconditionViolation { reason: String },
    #[error("Unsupported configuration: {reason}")]
    UnsupportedConfiguration { reason: String },
    #[error("No available kernel provider for chunk width {chunk_width}")]
    NoProvider { chunk_width: usize },
    #[error("Unsupported hardware: required {required}, available {available}")]
    UnsupportedHardware { required: String, available: String },
}

impl KernelError {
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::PreconditionViolation { reason: reason.into() }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration { reason: reason.into() }
    }
}

/// Result type alias for eltdrop operations
pub type Result<T> = std::result::Result<T, EltDropError>;
