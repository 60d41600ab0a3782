//! Reference-vs-candidate validation for dropout kernels.
//!
//! Runs a candidate provider and a reference provider on the same
//! deterministic input with identically seeded streams and compares every
//! output element bitwise and every mask byte or element. Buffers are filled
//! with `(row * stride + col) % 4096` and padded with a sentinel, so padding
//! a kernel writes into is reported as a mismatch too.

use crate::DropoutKernel;
use crate::buffer::{Buffer, BufferMut, MaskIn, MaskOut};
use crate::cpu::FallbackKernel;
use crate::precision::narrow;
use crate::rng::RngStream;
use eltdrop_common::{
    DataType, DropoutDescriptor, EltDropError, KernelConfig, MaskMode, Pass, Result,
};
use half::bf16;

const SENTINEL: f32 = -7.5;

/// Outcome of one validation run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationReport {
    pub elements_checked: usize,
    pub output_mismatches: usize,
    pub mask_mismatches: usize,
    /// `(row, column)` of the first differing output element, or of the
    /// first differing mask entry when the outputs agree.
    pub first_mismatch: Option<(usize, usize)>,
    pub passed: bool,
}

impl ValidationReport {
    /// Turn a failed report into an [`EltDropError::Validation`].
    pub fn into_result(self) -> Result<Self> {
        if self.passed {
            Ok(self)
        } else {
            Err(EltDropError::Validation(format!(
                "{} output and {} mask mismatches, first at {:?}",
                self.output_mismatches, self.mask_mismatches, self.first_mismatch
            )))
        }
    }
}

/// Owned buffer of either representation.
#[derive(Debug, Clone, PartialEq)]
enum Owned {
    F32(Vec<f32>),
    BF16(Vec<bf16>),
}

impl Owned {
    fn filled(data_type: DataType, len: usize, value: impl Fn(usize) -> f32) -> Self {
        match data_type {
            DataType::F32 => Self::F32((0..len).map(value).collect()),
            DataType::BF16 => Self::BF16((0..len).map(|i| narrow(value(i))).collect()),
        }
    }

    fn as_buffer(&self) -> Buffer<'_> {
        match self {
            Self::F32(v) => Buffer::F32(v),
            Self::BF16(v) => Buffer::BF16(v),
        }
    }

    fn as_buffer_mut(&mut self) -> BufferMut<'_> {
        match self {
            Self::F32(v) => BufferMut::F32(v),
            Self::BF16(v) => BufferMut::BF16(v),
        }
    }

    fn bits(&self) -> Vec<u32> {
        match self {
            Self::F32(v) => v.iter().map(|x| x.to_bits()).collect(),
            Self::BF16(v) => v.iter().map(|x| u32::from(x.to_bits())).collect(),
        }
    }
}

/// Recorded forward mask, owned.
#[derive(Debug, Clone, PartialEq)]
enum OwnedMask {
    None,
    Explicit(Owned),
    Bits(Vec<u8>),
}

impl OwnedMask {
    fn for_descriptor(desc: &DropoutDescriptor) -> Self {
        let layout = desc.mask_layout();
        let rows = desc.shape.row_count;
        match desc.mask_mode {
            MaskMode::None => Self::None,
            MaskMode::Explicit => {
                Self::Explicit(Owned::filled(desc.output_type, layout.explicit_len(rows), |_| SENTINEL))
            }
            MaskMode::Bitmask => Self::Bits(vec![0; layout.bitmask_len(rows)]),
        }
    }

    fn as_mask_out(&mut self) -> MaskOut<'_> {
        match self {
            Self::None => MaskOut::None,
            Self::Explicit(m) => MaskOut::Explicit(m.as_buffer_mut()),
            Self::Bits(m) => MaskOut::Bits(m),
        }
    }

    fn as_mask_in(&self) -> Option<MaskIn<'_>> {
        match self {
            Self::None => None,
            Self::Explicit(m) => Some(MaskIn::Explicit(m.as_buffer())),
            Self::Bits(m) => Some(MaskIn::Bits(m)),
        }
    }

    fn entries(&self) -> Vec<u32> {
        match self {
            Self::None => Vec::new(),
            Self::Explicit(m) => m.bits(),
            Self::Bits(m) => m.iter().map(|&b| u32::from(b)).collect(),
        }
    }
}

/// Compares a candidate provider against a reference provider.
pub struct DropoutValidator<'a> {
    reference: &'a dyn DropoutKernel,
    candidate: &'a dyn DropoutKernel,
    seed: u64,
}

impl<'a> DropoutValidator<'a> {
    pub fn new(reference: &'a dyn DropoutKernel, candidate: &'a dyn DropoutKernel) -> Self {
        Self { reference, candidate, seed: KernelConfig::default().seed }
    }

    /// Validate `candidate` against the scalar fallback.
    pub fn against_fallback(candidate: &'a dyn DropoutKernel) -> Self {
        Self::new(&FallbackKernel, candidate)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self, desc: &DropoutDescriptor, p: f32) -> Result<ValidationReport> {
        match desc.pass {
            Pass::Forward => self.validate_forward(desc, p),
            Pass::Backward => self.validate_backward(desc, p),
        }
    }

    pub fn validate_forward(&self, desc: &DropoutDescriptor, p: f32) -> Result<ValidationReport> {
        let input = Owned::filled(desc.input_type, desc.shape.required_input_len(), |i| {
            (i % 4096) as f32
        });
        let (ref_out, ref_mask) = self.run_forward(self.reference, desc, &input, p)?;
        let (cand_out, cand_mask) = self.run_forward(self.candidate, desc, &input, p)?;
        Ok(self.compare(desc, &ref_out, &cand_out, &ref_mask, &cand_mask))
    }

    /// The mask comes from a reference forward pass over the same input.
    pub fn validate_backward(&self, desc: &DropoutDescriptor, p: f32) -> Result<ValidationReport> {
        let forward = DropoutDescriptor { pass: Pass::Forward, ..*desc };
        forward.validate()?;
        let input = Owned::filled(desc.input_type, desc.shape.required_input_len(), |i| {
            (i % 4096) as f32
        });
        let (_, mask) = self.run_forward(self.reference, &forward, &input, p)?;
        let Some(mask_in) = mask.as_mask_in() else {
            // Unreachable for a valid backward descriptor.
            return Err(EltDropError::Validation("backward pass needs a mask".to_string()));
        };

        let run = |kernel: &dyn DropoutKernel| -> Result<Owned> {
            let mut output = Owned::filled(desc.output_type, desc.shape.required_output_len(), |_| {
                SENTINEL
            });
            kernel.backward(desc, input.as_buffer(), output.as_buffer_mut(), mask_in, p)?;
            Ok(output)
        };
        let ref_out = run(self.reference)?;
        let cand_out = run(self.candidate)?;
        Ok(self.compare(desc, &ref_out, &cand_out, &OwnedMask::None, &OwnedMask::None))
    }

    fn run_forward(
        &self,
        kernel: &dyn DropoutKernel,
        desc: &DropoutDescriptor,
        input: &Owned,
        p: f32,
    ) -> Result<(Owned, OwnedMask)> {
        let mut output =
            Owned::filled(desc.output_type, desc.shape.required_output_len(), |_| SENTINEL);
        let mut mask = OwnedMask::for_descriptor(desc);
        let mut rng = RngStream::new(self.seed);
        kernel.forward(
            desc,
            input.as_buffer(),
            output.as_buffer_mut(),
            mask.as_mask_out(),
            &mut rng,
            p,
        )?;
        Ok((output, mask))
    }

    fn compare(
        &self,
        desc: &DropoutDescriptor,
        ref_out: &Owned,
        cand_out: &Owned,
        ref_mask: &OwnedMask,
        cand_mask: &OwnedMask,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();
        let stride = desc.shape.output_stride.max(1);

        for (idx, (a, b)) in ref_out.bits().iter().zip(cand_out.bits()).enumerate() {
            report.elements_checked += 1;
            if *a != b {
                report.output_mismatches += 1;
                if report.first_mismatch.is_none() {
                    report.first_mismatch = Some((idx / stride, idx % stride));
                }
            }
        }

        let layout = desc.mask_layout();
        let mask_stride = match ref_mask {
            OwnedMask::Bits(_) => layout.bitmask_stride_bytes(),
            _ => layout.explicit_stride(),
        }
        .max(1);
        for (idx, (a, b)) in ref_mask.entries().iter().zip(cand_mask.entries()).enumerate() {
            if *a != b {
                report.mask_mismatches += 1;
                if report.first_mismatch.is_none() {
                    report.first_mismatch = Some((idx / mask_stride, idx % mask_stride));
                }
            }
        }

        report.passed = report.output_mismatches == 0 && report.mask_mismatches == 0;
        if report.passed {
            log::debug!(
                "{} matches {} on {} elements",
                self.candidate.name(),
                self.reference.name(),
                report.elements_checked
            );
        } else {
            log::warn!(
                "{} differs from {}: {} output, {} mask mismatches, first at {:?}",
                self.candidate.name(),
                self.reference.name(),
                report.output_mismatches,
                report.mask_mismatches,
                report.first_mismatch
            );
        }
        report
    }
}
