//! Common types, traits, and utilities for eltdrop kernels
//!
//! This crate provides the foundational types shared by the kernel crate:
//! the error taxonomy, data-type and mask-mode tags, array-view shapes with
//! their stride math, and the kernel configuration loader.

pub mod error;
pub mod kernel_config;
pub mod math;
pub mod shape;
pub mod types;

pub use error::*;
pub use kernel_config::{KernelConfig, KernelConfigError, KernelPreference};
pub use math::ceil_div;
pub use shape::{DropoutDescriptor, DropoutShape, MaskLayout};
pub use types::*;
