//! CPU kernel implementations
//!
//! Both providers share the argument checks and the type dispatch in this
//! module; they differ only in how a row job is executed.

pub mod fallback;
#[cfg(all(target_arch = "x86_64", feature = "avx2"))]
pub mod x86;

pub use fallback::FallbackKernel;
#[cfg(all(target_arch = "x86_64", feature = "avx2"))]
pub use x86::Avx2Kernel;

use crate::bitmask::BitMaskCodec;
use crate::buffer::{Buffer, BufferMut, MaskIn, MaskOut};
use crate::precision::Element;
use crate::rng::UniformStream;
use eltdrop_common::{
    DataType, DropoutDescriptor, EltDropError, KernelError, MaskLayout, MaskMode, Pass, Result,
};
use half::bf16;

/// Keep threshold and inverse keep-probability for one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeepProbability {
    /// `1 - p`; a lane is kept iff its draw is strictly below this.
    pub keep: f32,
    /// `1 / (1 - p)`, rounded once to f32.
    pub scale: f32,
}

impl KeepProbability {
    /// `p` is the probability of dropping and must lie in `[0, 1)`.
    pub fn from_drop_probability(p: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(KernelError::precondition(format!(
                "drop probability must be in [0, 1), got {p}"
            ))
            .into());
        }
        let keep = 1.0 - p;
        Ok(Self { keep, scale: (1.0 / f64::from(keep)) as f32 })
    }
}

/// Typed forward work over a whole matrix.
pub(crate) struct ForwardJob<'a, Tin, Tout> {
    pub layout: MaskLayout,
    pub codec: BitMaskCodec,
    pub row_count: usize,
    pub input_stride: usize,
    pub output_stride: usize,
    pub input: &'a [Tin],
    pub output: &'a mut [Tout],
    pub mask: MaskSink<'a, Tout>,
    pub probability: KeepProbability,
    /// Factor applied to kept lanes. With an explicit mask this is the
    /// stored mask value widened back to f32, so that the backward pass
    /// over that mask reproduces the forward output bit for bit.
    pub multiplier: f32,
}

pub(crate) enum MaskSink<'a, T> {
    None,
    Explicit(&'a mut [T]),
    Bits(&'a mut [u8]),
}

/// Typed backward work over a whole matrix, for a mask of element type `Tm`.
pub(crate) struct BackwardJob<'a, Tin, Tout> {
    pub layout: MaskLayout,
    pub codec: BitMaskCodec,
    pub row_count: usize,
    pub input_stride: usize,
    pub output_stride: usize,
    pub input: &'a [Tin],
    pub output: &'a mut [Tout],
    pub probability: KeepProbability,
}

#[derive(Clone, Copy)]
pub(crate) enum MaskSource<'a, Tm> {
    Explicit(&'a [Tm]),
    Bits(&'a [u8]),
}

/// Row execution strategy of a provider.
pub(crate) trait RowKernel {
    fn forward_rows<Tin: Element, Tout: Element>(
        &self,
        job: ForwardJob<'_, Tin, Tout>,
        rng: &mut dyn UniformStream,
    );

    fn backward_rows<Tin: Element, Tout: Element, Tm: Element>(
        &self,
        job: BackwardJob<'_, Tin, Tout>,
        mask: MaskSource<'_, Tm>,
    );
}

fn type_mismatch(operand: &str, expected: DataType, got: DataType) -> EltDropError {
    KernelError::precondition(format!("{operand} buffer is {got}, descriptor expects {expected}"))
        .into()
}

fn too_short(operand: &str, required: usize, got: usize) -> EltDropError {
    KernelError::precondition(format!(
        "{operand} buffer too small: expected at least {required}, got {got}"
    ))
    .into()
}

fn check_operands(
    desc: &DropoutDescriptor,
    pass: Pass,
    input: &Buffer<'_>,
    output: &BufferMut<'_>,
    mask_mode: MaskMode,
) -> Result<()> {
    desc.validate()?;
    if desc.pass != pass {
        return Err(KernelError::unsupported(format!(
            "descriptor was built for the {} pass, called as {pass}",
            desc.pass
        ))
        .into());
    }
    if input.data_type() != desc.input_type {
        return Err(type_mismatch("input", desc.input_type, input.data_type()));
    }
    if output.data_type() != desc.output_type {
        return Err(type_mismatch("output", desc.output_type, output.data_type()));
    }
    if mask_mode != desc.mask_mode {
        return Err(KernelError::precondition(format!(
            "mask is {mask_mode}, descriptor expects {}",
            desc.mask_mode
        ))
        .into());
    }
    let shape = &desc.shape;
    if input.len() < shape.required_input_len() {
        return Err(too_short("input", shape.required_input_len(), input.len()));
    }
    if output.len() < shape.required_output_len() {
        return Err(too_short("output", shape.required_output_len(), output.len()));
    }
    Ok(())
}

fn check_mask_len(layout: &MaskLayout, row_count: usize, mode: MaskMode, len: usize) -> Result<()> {
    let required = layout.mask_len(mode, row_count).ok_or_else(|| {
        EltDropError::from(KernelError::precondition(format!(
            "{mode} mask extent for {row_count} rows overflows the address space"
        )))
    })?;
    if len < required {
        return Err(too_short("mask", required, len));
    }
    Ok(())
}

/// Validate a forward call completely, then run it on `kernel`.
pub(crate) fn run_forward<K: RowKernel>(
    kernel: &K,
    desc: &DropoutDescriptor,
    input: Buffer<'_>,
    output: BufferMut<'_>,
    mask: MaskOut<'_>,
    rng: &mut dyn UniformStream,
    p: f32,
) -> Result<()> {
    check_operands(desc, Pass::Forward, &input, &output, mask.mode())?;
    let layout = desc.mask_layout();
    let row_count = desc.shape.row_count;
    match &mask {
        MaskOut::None => {}
        MaskOut::Explicit(m) => {
            if m.data_type() != desc.output_type {
                return Err(type_mismatch("explicit mask", desc.output_type, m.data_type()));
            }
            check_mask_len(&layout, row_count, MaskMode::Explicit, m.len())?;
        }
        MaskOut::Bits(m) => check_mask_len(&layout, row_count, MaskMode::Bitmask, m.len())?,
    }
    let probability = KeepProbability::from_drop_probability(p)?;
    if desc.shape.is_empty() {
        return Ok(());
    }

    match (desc.input_type, desc.output_type) {
        (DataType::F32, DataType::F32) => {
            forward_typed::<K, f32, f32>(kernel, desc, input, output, mask, rng, probability)
        }
        (DataType::F32, DataType::BF16) => {
            forward_typed::<K, f32, bf16>(kernel, desc, input, output, mask, rng, probability)
        }
        (DataType::BF16, DataType::F32) => {
            forward_typed::<K, bf16, f32>(kernel, desc, input, output, mask, rng, probability)
        }
        (DataType::BF16, DataType::BF16) => {
            forward_typed::<K, bf16, bf16>(kernel, desc, input, output, mask, rng, probability)
        }
    }
}

fn forward_typed<K: RowKernel, Tin: Element, Tout: Element>(
    kernel: &K,
    desc: &DropoutDescriptor,
    input: Buffer<'_>,
    output: BufferMut<'_>,
    mask: MaskOut<'_>,
    rng: &mut dyn UniformStream,
    probability: KeepProbability,
) -> Result<()> {
    let in_type = input.data_type();
    let out_type = output.data_type();
    let input = Tin::slice(input).ok_or_else(|| type_mismatch("input", Tin::DATA_TYPE, in_type))?;
    let output =
        Tout::slice_mut(output).ok_or_else(|| type_mismatch("output", Tout::DATA_TYPE, out_type))?;
    let mask = match mask {
        MaskOut::None => MaskSink::None,
        MaskOut::Explicit(m) => {
            let got = m.data_type();
            MaskSink::Explicit(
                Tout::slice_mut(m)
                    .ok_or_else(|| type_mismatch("explicit mask", Tout::DATA_TYPE, got))?,
            )
        }
        MaskOut::Bits(m) => MaskSink::Bits(m),
    };
    let multiplier = if matches!(mask, MaskSink::Explicit(_)) {
        Tout::from_f32(probability.scale).to_f32()
    } else {
        probability.scale
    };
    let job = ForwardJob {
        layout: desc.mask_layout(),
        codec: BitMaskCodec::new(desc.chunk_width)?,
        row_count: desc.shape.row_count,
        input_stride: desc.shape.input_stride,
        output_stride: desc.shape.output_stride,
        input,
        output,
        mask,
        probability,
        multiplier,
    };
    kernel.forward_rows(job, rng);
    Ok(())
}

/// Validate a backward call completely, then run it on `kernel`.
pub(crate) fn run_backward<K: RowKernel>(
    kernel: &K,
    desc: &DropoutDescriptor,
    input: Buffer<'_>,
    output: BufferMut<'_>,
    mask: MaskIn<'_>,
    p: f32,
) -> Result<()> {
    check_operands(desc, Pass::Backward, &input, &output, mask.mode())?;
    let layout = desc.mask_layout();
    let mask_len = match &mask {
        MaskIn::Explicit(m) => m.len(),
        MaskIn::Bits(m) => m.len(),
    };
    check_mask_len(&layout, desc.shape.row_count, mask.mode(), mask_len)?;
    let probability = KeepProbability::from_drop_probability(p)?;
    if desc.shape.is_empty() {
        return Ok(());
    }

    match (desc.input_type, desc.output_type) {
        (DataType::F32, DataType::F32) => {
            backward_typed::<K, f32, f32>(kernel, desc, input, output, mask, probability)
        }
        (DataType::F32, DataType::BF16) => {
            backward_typed::<K, f32, bf16>(kernel, desc, input, output, mask, probability)
        }
        (DataType::BF16, DataType::F32) => {
            backward_typed::<K, bf16, f32>(kernel, desc, input, output, mask, probability)
        }
        (DataType::BF16, DataType::BF16) => {
            backward_typed::<K, bf16, bf16>(kernel, desc, input, output, mask, probability)
        }
    }
}

fn backward_typed<K: RowKernel, Tin: Element, Tout: Element>(
    kernel: &K,
    desc: &DropoutDescriptor,
    input: Buffer<'_>,
    output: BufferMut<'_>,
    mask: MaskIn<'_>,
    probability: KeepProbability,
) -> Result<()> {
    let in_type = input.data_type();
    let out_type = output.data_type();
    let input = Tin::slice(input).ok_or_else(|| type_mismatch("input", Tin::DATA_TYPE, in_type))?;
    let output =
        Tout::slice_mut(output).ok_or_else(|| type_mismatch("output", Tout::DATA_TYPE, out_type))?;
    let job = BackwardJob {
        layout: desc.mask_layout(),
        codec: BitMaskCodec::new(desc.chunk_width)?,
        row_count: desc.shape.row_count,
        input_stride: desc.shape.input_stride,
        output_stride: desc.shape.output_stride,
        input,
        output,
        probability,
    };
    match mask {
        MaskIn::Bits(bits) => kernel.backward_rows::<Tin, Tout, f32>(job, MaskSource::Bits(bits)),
        MaskIn::Explicit(Buffer::F32(m)) => kernel.backward_rows(job, MaskSource::Explicit(m)),
        MaskIn::Explicit(Buffer::BF16(m)) => kernel.backward_rows(job, MaskSource::Explicit(m)),
    }
    Ok(())
}
