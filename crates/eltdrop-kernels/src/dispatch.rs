//! Dispatched dropout transforms.
//!
//! [`KernelManager::dispatch`](crate::KernelManager::dispatch) binds a
//! validated descriptor to a provider once; the resulting
//! [`DropoutFunction`] is then called with buffers as often as needed.

use crate::DropoutKernel;
use crate::buffer::{Buffer, BufferMut, MaskIn, MaskOut};
use crate::rng::UniformStream;
use eltdrop_common::{DropoutDescriptor, KernelError, MaskLayout, Pass, Result};

/// A descriptor bound to the provider that will run it.
#[derive(Clone, Copy)]
pub struct DropoutFunction<'k> {
    desc: DropoutDescriptor,
    kernel: &'k dyn DropoutKernel,
}

impl std::fmt::Debug for DropoutFunction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropoutFunction")
            .field("desc", &self.desc)
            .field("kernel", &self.kernel.name())
            .finish()
    }
}

impl<'k> DropoutFunction<'k> {
    pub(crate) fn new(desc: DropoutDescriptor, kernel: &'k dyn DropoutKernel) -> Self {
        Self { desc, kernel }
    }

    pub fn descriptor(&self) -> &DropoutDescriptor {
        &self.desc
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    /// Mask geometry callers size their mask buffers with.
    pub fn mask_layout(&self) -> MaskLayout {
        self.desc.mask_layout()
    }

    fn expect_pass(&self, pass: Pass) -> Result<()> {
        if self.desc.pass == pass {
            Ok(())
        } else {
            Err(KernelError::unsupported(format!(
                "function was dispatched for the {} pass, called as {pass}",
                self.desc.pass
            ))
            .into())
        }
    }

    /// Run the forward pass. `p` is the drop probability, `0 <= p < 1`.
    pub fn forward(
        &self,
        input: Buffer<'_>,
        output: BufferMut<'_>,
        mask: MaskOut<'_>,
        rng: &mut dyn UniformStream,
        p: f32,
    ) -> Result<()> {
        self.expect_pass(Pass::Forward)?;
        self.kernel.forward(&self.desc, input, output, mask, rng, p)
    }

    /// Run the backward pass with the mask a forward pass recorded.
    pub fn backward(
        &self,
        input: Buffer<'_>,
        output: BufferMut<'_>,
        mask: MaskIn<'_>,
        p: f32,
    ) -> Result<()> {
        self.expect_pass(Pass::Backward)?;
        self.kernel.backward(&self.desc, input, output, mask, p)
    }
}
