//! Mixed-precision dropout kernels for eltdrop
//!
//! A forward pass zeroes each element with probability `p`, scales the
//! survivors by `1 / (1 - p)` and records the decisions as an explicit scale
//! per element or as a packed bit mask. A backward pass re-applies a
//! recorded mask. Both accept f32 or bf16 on either side and compute in f32.
//!
//! ```no_run
//! use eltdrop_common::{DataType, DropoutDescriptor, DropoutShape, MaskMode};
//! use eltdrop_kernels::{KernelManager, MaskOut, RngStream};
//!
//! # fn main() -> eltdrop_common::Result<()> {
//! let shape = DropoutShape::dense(64, 4);
//! let desc = DropoutDescriptor::forward(shape, DataType::F32, DataType::F32, MaskMode::Bitmask);
//! let manager = KernelManager::new();
//! let dropout = manager.dispatch(&desc)?;
//!
//! let input = vec![1.0f32; shape.required_input_len()];
//! let mut output = vec![0.0f32; shape.required_output_len()];
//! let mut mask = vec![0u8; dropout.mask_layout().bitmask_len(shape.row_count)];
//! let mut rng = RngStream::new(555);
//! dropout.forward((&input).into(), (&mut output).into(), MaskOut::Bits(&mut mask), &mut rng, 0.1)?;
//! # Ok(())
//! # }
//! ```

use eltdrop_common::{
    DropoutDescriptor, EltDropError, KernelConfig, KernelError, KernelPreference, MAX_CHUNK_WIDTH,
    Result,
};
use std::sync::OnceLock;

pub mod bitmask;
pub mod buffer;
pub mod cpu;
pub mod dispatch;
pub mod precision;
pub mod rng;
pub mod validation;

pub use bitmask::BitMaskCodec;
pub use buffer::{Buffer, BufferMut, MaskIn, MaskOut};
pub use dispatch::DropoutFunction;
pub use precision::{Element, narrow, widen};
pub use rng::{ReplayStream, RngStream, UniformStream};
pub use validation::{DropoutValidator, ValidationReport};

/// Dropout kernel provider trait
///
/// Implementations check every argument before writing: a call either
/// transforms the whole view or returns an error with all buffers untouched.
pub trait DropoutKernel: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;

    fn supports_chunk_width(&self, chunk_width: usize) -> bool {
        (1..=MAX_CHUNK_WIDTH).contains(&chunk_width)
    }

    /// Drop with probability `p`, drawing one chunk of uniforms from `rng`
    /// per mask chunk.
    fn forward(
        &self,
        desc: &DropoutDescriptor,
        input: Buffer<'_>,
        output: BufferMut<'_>,
        mask: MaskOut<'_>,
        rng: &mut dyn UniformStream,
        p: f32,
    ) -> Result<()>;

    /// Re-apply a mask recorded by a forward pass with the same `p`.
    fn backward(
        &self,
        desc: &DropoutDescriptor,
        input: Buffer<'_>,
        output: BufferMut<'_>,
        mask: MaskIn<'_>,
        p: f32,
    ) -> Result<()>;
}

/// Kernel manager for selecting kernels with cached selection
pub struct KernelManager {
    providers: Vec<Box<dyn DropoutKernel>>,
    preference: KernelPreference,
    chunk_width: usize,
    selected: OnceLock<usize>,
}

impl KernelManager {
    pub fn new() -> Self {
        Self::with_config(&KernelConfig::default())
    }

    pub fn with_config(config: &KernelConfig) -> Self {
        let mut providers: Vec<Box<dyn DropoutKernel>> = vec![Box::new(cpu::FallbackKernel)];

        // Optimized providers go ahead of the fallback, best first.
        #[cfg(all(target_arch = "x86_64", feature = "avx2"))]
        {
            if is_x86_feature_detected!("avx2") {
                log::debug!("AVX2 detected, registering avx2 provider");
                providers.insert(0, Box::new(cpu::Avx2Kernel));
            }
        }

        Self {
            providers,
            preference: config.preferred_kernel,
            chunk_width: config.chunk_width,
            selected: OnceLock::new(),
        }
    }

    /// Select the provider for the configured chunk width, caching the choice.
    pub fn select_best(&self) -> Result<&dyn DropoutKernel> {
        if let Some(&idx) = self.selected.get() {
            return Ok(self.providers[idx].as_ref());
        }
        let idx = self.select_index(self.chunk_width)?;
        let idx = *self.selected.get_or_init(|| {
            log::info!("Selected kernel provider: {}", self.providers[idx].name());
            idx
        });
        Ok(self.providers[idx].as_ref())
    }

    /// Select a provider for an arbitrary chunk width, honouring the preference.
    pub fn select_for(&self, chunk_width: usize) -> Result<&dyn DropoutKernel> {
        if chunk_width == self.chunk_width {
            return self.select_best();
        }
        let idx = self.select_index(chunk_width)?;
        Ok(self.providers[idx].as_ref())
    }

    fn select_index(&self, chunk_width: usize) -> Result<usize> {
        let position = |name: &str| self.providers.iter().position(|p| p.name() == name);

        match self.preference {
            KernelPreference::Auto => self
                .providers
                .iter()
                .position(|p| p.is_available() && p.supports_chunk_width(chunk_width))
                .ok_or_else(|| {
                    log::warn!("No kernel provider accepts chunk width {chunk_width}");
                    EltDropError::Kernel(KernelError::NoProvider { chunk_width })
                }),
            KernelPreference::Fallback => {
                let idx = position("fallback")
                    .ok_or(EltDropError::Kernel(KernelError::NoProvider { chunk_width }))?;
                self.check_supports(idx, chunk_width)?;
                Ok(idx)
            }
            KernelPreference::Avx2 => {
                let idx = position("avx2").ok_or_else(|| {
                    log::warn!("avx2 kernel requested but not available on this host");
                    EltDropError::Kernel(KernelError::UnsupportedHardware {
                        required: "AVX2".to_string(),
                        available: "none".to_string(),
                    })
                })?;
                self.check_supports(idx, chunk_width)?;
                Ok(idx)
            }
        }
    }

    fn check_supports(&self, idx: usize, chunk_width: usize) -> Result<()> {
        let provider = &self.providers[idx];
        if provider.supports_chunk_width(chunk_width) {
            Ok(())
        } else {
            log::warn!("{} kernel cannot process chunk width {chunk_width}", provider.name());
            Err(KernelError::unsupported(format!(
                "{} kernel cannot process chunk width {chunk_width}",
                provider.name()
            ))
            .into())
        }
    }

    /// Bind a descriptor to a provider. The descriptor is validated here so
    /// configuration errors surface before any buffer is involved.
    pub fn dispatch(&self, desc: &DropoutDescriptor) -> Result<DropoutFunction<'_>> {
        desc.validate()?;
        let kernel = self.select_for(desc.chunk_width)?;
        log::debug!(
            "Dispatching {} pass {}x{} {} -> {} ({} mask, chunk width {}) to {}",
            desc.pass,
            desc.shape.row_width,
            desc.shape.row_count,
            desc.input_type,
            desc.output_type,
            desc.mask_mode,
            desc.chunk_width,
            kernel.name()
        );
        Ok(DropoutFunction::new(*desc, kernel))
    }

    /// Get the name of the currently selected kernel provider
    pub fn selected_provider_name(&self) -> Option<&'static str> {
        self.selected.get().and_then(|&idx| self.providers.get(idx)).map(|p| p.name())
    }

    /// List all available kernel providers
    pub fn list_available_providers(&self) -> Vec<&'static str> {
        self.providers.iter().filter(|p| p.is_available()).map(|p| p.name()).collect()
    }

    /// Force reselection of kernel provider (for testing)
    #[cfg(test)]
    pub fn reset_selection(&mut self) {
        self.selected = OnceLock::new();
    }
}

impl Default for KernelManager {
    fn default() -> Self {
        Self::new()
    }
}

// Re-export commonly used types
pub use cpu::FallbackKernel;
#[cfg(all(target_arch = "x86_64", feature = "avx2"))]
pub use cpu::Avx2Kernel;
pub use cpu::KeepProbability;
