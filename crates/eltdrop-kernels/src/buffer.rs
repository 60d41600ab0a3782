//! Caller-owned buffer views tagged with their element representation.
//!
//! Kernels never allocate: every operand arrives as a borrowed slice whose
//! tag must agree with the descriptor the transform was dispatched for.

use eltdrop_common::{DataType, MaskMode};
use half::bf16;

/// Read-only operand.
#[derive(Debug, Clone, Copy)]
pub enum Buffer<'a> {
    F32(&'a [f32]),
    BF16(&'a [bf16]),
}

impl Buffer<'_> {
    pub fn data_type(&self) -> DataType {
        match self {
            Buffer::F32(_) => DataType::F32,
            Buffer::BF16(_) => DataType::BF16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(s) => s.len(),
            Buffer::BF16(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> From<&'a [f32]> for Buffer<'a> {
    fn from(s: &'a [f32]) -> Self {
        Buffer::F32(s)
    }
}

impl<'a> From<&'a [bf16]> for Buffer<'a> {
    fn from(s: &'a [bf16]) -> Self {
        Buffer::BF16(s)
    }
}

impl<'a> From<&'a Vec<f32>> for Buffer<'a> {
    fn from(v: &'a Vec<f32>) -> Self {
        Buffer::F32(v)
    }
}

impl<'a> From<&'a Vec<bf16>> for Buffer<'a> {
    fn from(v: &'a Vec<bf16>) -> Self {
        Buffer::BF16(v)
    }
}

/// Writable operand.
#[derive(Debug)]
pub enum BufferMut<'a> {
    F32(&'a mut [f32]),
    BF16(&'a mut [bf16]),
}

impl BufferMut<'_> {
    pub fn data_type(&self) -> DataType {
        match self {
            BufferMut::F32(_) => DataType::F32,
            BufferMut::BF16(_) => DataType::BF16,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BufferMut::F32(s) => s.len(),
            BufferMut::BF16(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reborrow for a shorter lifetime.
    pub fn reborrow(&mut self) -> BufferMut<'_> {
        match self {
            BufferMut::F32(s) => BufferMut::F32(s),
            BufferMut::BF16(s) => BufferMut::BF16(s),
        }
    }
}

impl<'a> From<&'a mut [f32]> for BufferMut<'a> {
    fn from(s: &'a mut [f32]) -> Self {
        BufferMut::F32(s)
    }
}

impl<'a> From<&'a mut [bf16]> for BufferMut<'a> {
    fn from(s: &'a mut [bf16]) -> Self {
        BufferMut::BF16(s)
    }
}

impl<'a> From<&'a mut Vec<f32>> for BufferMut<'a> {
    fn from(v: &'a mut Vec<f32>) -> Self {
        BufferMut::F32(v)
    }
}

impl<'a> From<&'a mut Vec<bf16>> for BufferMut<'a> {
    fn from(v: &'a mut Vec<bf16>) -> Self {
        BufferMut::BF16(v)
    }
}

/// Mask destination of a forward pass.
#[derive(Debug)]
pub enum MaskOut<'a> {
    None,
    /// Scale per lane, in the output's representation.
    Explicit(BufferMut<'a>),
    /// Packed chunks, see [`eltdrop_common::MaskLayout`].
    Bits(&'a mut [u8]),
}

impl MaskOut<'_> {
    pub fn mode(&self) -> MaskMode {
        match self {
            MaskOut::None => MaskMode::None,
            MaskOut::Explicit(_) => MaskMode::Explicit,
            MaskOut::Bits(_) => MaskMode::Bitmask,
        }
    }
}

/// Mask source of a backward pass.
#[derive(Debug, Clone, Copy)]
pub enum MaskIn<'a> {
    Explicit(Buffer<'a>),
    Bits(&'a [u8]),
}

impl MaskIn<'_> {
    pub fn mode(&self) -> MaskMode {
        match self {
            MaskIn::Explicit(_) => MaskMode::Explicit,
            MaskIn::Bits(_) => MaskMode::Bitmask,
        }
    }
}
